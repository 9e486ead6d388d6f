use crate::models::Session;
use crate::session::{KeyValueStore, SessionStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Login,
    ResetPassword(String),
    Dashboard,
    ChangePassword,
    AdminUsers,
}

impl Route {
    pub fn is_public(&self) -> bool {
        matches!(self, Route::Login | Route::ResetPassword(_))
    }

    fn requires_admin(&self) -> bool {
        matches!(self, Route::AdminUsers)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Access {
    /// Public route; renders with or without a session.
    Public,
    /// Protected route with the session that authorised it.
    Authenticated(Session),
    /// Not allowed here; go to the given route instead.
    Redirect(Route),
}

/// Decide whether `route` may render. Reads the store on every call so a
/// session cleared between navigations locks out the very next one.
/// No stored session is the anonymous state; anything else is authenticated.
pub fn authorize<S: KeyValueStore>(store: &SessionStore<S>, route: &Route) -> Access {
    if route.is_public() {
        return Access::Public;
    }
    match store.get_session() {
        None => Access::Redirect(Route::Login),
        Some(s) if route.requires_admin() && !s.user.is_admin => Access::Redirect(Route::Dashboard),
        Some(s) => Access::Authenticated(s),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::decode;
    use crate::session::MemoryStore;
    use serde_json::json;

    fn login(store: &SessionStore<MemoryStore>, admin: bool) {
        let user = decode(json!({"nom_com": "Notaria", "flg_adm": u8::from(admin)})).unwrap();
        store
            .set_session(&Session { user, token: "t".into() })
            .unwrap();
    }

    #[test]
    fn anonymous_is_redirected_to_login() {
        let store = SessionStore::new(MemoryStore::new());
        for route in [Route::Dashboard, Route::ChangePassword, Route::AdminUsers] {
            assert_eq!(authorize(&store, &route), Access::Redirect(Route::Login));
        }
    }

    #[test]
    fn public_routes_always_render() {
        let store = SessionStore::new(MemoryStore::new());
        assert_eq!(authorize(&store, &Route::Login), Access::Public);
        assert_eq!(authorize(&store, &Route::ResetPassword("abc".into())), Access::Public);
    }

    #[test]
    fn login_then_logout_flow() {
        let store = SessionStore::new(MemoryStore::new());
        login(&store, false);
        assert!(matches!(authorize(&store, &Route::Dashboard), Access::Authenticated(_)));
        store.clear_session().unwrap();
        assert_eq!(authorize(&store, &Route::Dashboard), Access::Redirect(Route::Login));
    }

    #[test]
    fn admin_route_requires_admin_flag() {
        let store = SessionStore::new(MemoryStore::new());
        login(&store, false);
        assert_eq!(authorize(&store, &Route::AdminUsers), Access::Redirect(Route::Dashboard));
        login(&store, true);
        assert!(matches!(authorize(&store, &Route::AdminUsers), Access::Authenticated(_)));
    }

    #[test]
    fn profile_without_fields_is_still_authenticated() {
        let store = SessionStore::new(MemoryStore::new());
        let user = decode(json!({})).unwrap();
        store
            .set_session(&Session { user, token: "t".into() })
            .unwrap();
        assert!(matches!(authorize(&store, &Route::Dashboard), Access::Authenticated(_)));
        assert_eq!(authorize(&store, &Route::AdminUsers), Access::Redirect(Route::Dashboard));
    }
}
