use serde_json::json;

use super::ApiClient;
use crate::aggregate::next_status;
use crate::error::{ConsultaError, Result};
use crate::models::{ManagedUser, MessageResponse, NewUser, Person};
use crate::normalize::{decode, decode_list, Ident};

impl ApiClient {
    pub fn list_users(&self) -> Result<Vec<ManagedUser>> {
        let value = self.get_json("/api/users", "Could not load users")?;
        decode_list(value)
    }

    pub fn create_user(&self, user: &NewUser) -> Result<MessageResponse> {
        if user.cor_ele.trim().is_empty() || !user.cor_ele.contains('@') {
            return Err(ConsultaError::Validation(
                "A valid email address is required.".to_string(),
            ));
        }
        let value = self.post_json("/api/users", user, "Could not create the user")?;
        decode(value)
    }

    /// Flip one user's active flag. Admin rows are refused before any request
    /// is made. Returns the new status.
    pub fn toggle_user_status(&self, users: &[ManagedUser], id: &Ident) -> Result<bool> {
        let active = next_status(users, id)?;
        self.put_json(
            "/api/users/toggle-status",
            &json!({ "id": id, "act_ina": u8::from(active) }),
            "Could not update the user status",
        )?;
        Ok(active)
    }

    /// National-ID lookup used before registering a collaborator.
    pub fn lookup_person(&self, dni: &str) -> Result<Person> {
        let dni = dni.trim();
        if dni.is_empty() || !dni.chars().all(|c| c.is_ascii_digit()) {
            return Err(ConsultaError::Validation(
                "The national ID may only contain digits.".to_string(),
            ));
        }
        let value = self.get_json(
            &format!("/api/mantenimiento/siam/persona/{dni}"),
            "Person not found",
        )?;
        decode(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::apply_status;
    use crate::api::client::testing::serve_json;
    use crate::settings::Settings;

    fn users() -> Vec<ManagedUser> {
        decode_list(json!([
            {"id": 1, "nom_usu": "Ana", "flg_adm": 1, "act_ina": 1, "ide_not_sol_ser": 9},
            {"id": 2, "nom_usu": "Luis", "flg_adm": 0, "act_ina": 1, "ide_not_sol_ser": 9},
            {"id": 3, "nom_usu": "Rosa", "flg_adm": 0, "act_ina": 0, "ide_not_sol_ser": 9},
        ]))
        .unwrap()
    }

    #[test]
    fn toggle_flips_exactly_one_user() {
        let (settings, server) = serve_json("200 OK", r#"{"message": "ok"}"#);
        let client = ApiClient::new(&settings, Some("t".into())).unwrap();
        let mut list = users();
        let active = client.toggle_user_status(&list, &Ident::new(2)).unwrap();
        assert!(!active);
        apply_status(&mut list, &Ident::new(2), active);
        assert_eq!(
            list.iter().map(|u| u.active).collect::<Vec<_>>(),
            vec![true, false, false]
        );
        let req = server.join().unwrap();
        assert_eq!(req.request_line, "PUT /api/users/toggle-status HTTP/1.1");
        assert_eq!(req.json(), json!({"id": 2, "act_ina": 0}));
    }

    #[test]
    fn toggling_an_admin_is_refused_locally() {
        let settings = Settings {
            api_base_url: "http://127.0.0.1:9".to_string(),
            ..Settings::default()
        };
        let client = ApiClient::new(&settings, Some("t".into())).unwrap();
        let err = client.toggle_user_status(&users(), &Ident::new(1)).unwrap_err();
        assert!(matches!(err, ConsultaError::Forbidden(_)));
    }

    #[test]
    fn create_user_posts_backend_fields() {
        let (settings, server) = serve_json("201 Created", r#"{"message": "Usuario registrado"}"#);
        let client = ApiClient::new(&settings, Some("t".into())).unwrap();
        let resp = client
            .create_user(&NewUser {
                ide_per: Ident::new(88),
                cor_ele: "new@notaria.pe".into(),
                flg_adm: 0,
            })
            .unwrap();
        assert_eq!(resp.message, "Usuario registrado");
        assert_eq!(
            server.join().unwrap().json(),
            json!({"ide_per": 88, "cor_ele": "new@notaria.pe", "flg_adm": 0})
        );
    }

    #[test]
    fn person_lookup() {
        let (settings, server) = serve_json("200 OK", r#"{"IDE_PER": 88, "NOM_COM": "ANA ROJAS"}"#);
        let client = ApiClient::new(&settings, Some("t".into())).unwrap();
        let person = client.lookup_person("45678912").unwrap();
        assert_eq!(person.display_name(), "ANA ROJAS");
        assert_eq!(
            server.join().unwrap().request_line,
            "GET /api/mantenimiento/siam/persona/45678912 HTTP/1.1"
        );
    }
}
