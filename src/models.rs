use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::normalize::{lenient, Ident};

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Profile of the logged-in organisation user, in backend field names.
/// Unknown fields are kept so a patched profile re-serialises losslessly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    #[serde(rename = "nom_com", default, deserialize_with = "lenient::text")]
    pub name: String,
    #[serde(rename = "raz_soc", default, deserialize_with = "lenient::opt_text", skip_serializing_if = "Option::is_none")]
    pub legal_name: Option<String>,
    #[serde(rename = "cor_ele", default, deserialize_with = "lenient::text")]
    pub email: String,
    #[serde(rename = "dir_not", default, deserialize_with = "lenient::opt_text", skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(rename = "des_dis", default, deserialize_with = "lenient::opt_text", skip_serializing_if = "Option::is_none")]
    pub district: Option<String>,
    #[serde(rename = "des_pro", default, deserialize_with = "lenient::opt_text", skip_serializing_if = "Option::is_none")]
    pub province: Option<String>,
    #[serde(rename = "flg_adm", default, deserialize_with = "lenient::flag", serialize_with = "lenient::ser_flag")]
    pub is_admin: bool,
    /// `None` when the backend sent no flag; only an explicit 0 asks for a first change.
    #[serde(rename = "flg_cam_psw", default, deserialize_with = "lenient::opt_flag", serialize_with = "lenient::ser_opt_flag", skip_serializing_if = "Option::is_none")]
    pub first_change_done: Option<bool>,
    #[serde(rename = "fch_cam_psw", default, deserialize_with = "lenient::opt_text")]
    pub last_password_change: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub user: UserProfile,
    pub token: String,
}

/// Days after which a password is considered stale.
pub const PASSWORD_MAX_AGE_DAYS: i64 = 60;

#[derive(Debug, Clone, PartialEq)]
pub enum PasswordAdvice {
    FirstChange,
    Stale { days: i64 },
}

impl PasswordAdvice {
    pub fn message(&self) -> String {
        match self {
            PasswordAdvice::FirstChange => {
                "To protect your account, please make your first password change.".to_string()
            }
            PasswordAdvice::Stale { days } => format!(
                "Your password has not been changed in {days} days. Consider changing it."
            ),
        }
    }
}

impl UserProfile {
    /// Organisation name shown in headers: trade name, else legal name.
    pub fn display_name(&self) -> &str {
        if !self.name.is_empty() {
            &self.name
        } else {
            self.legal_name.as_deref().unwrap_or("")
        }
    }

    pub fn password_advice(&self, now: DateTime<Utc>) -> Option<PasswordAdvice> {
        if self.first_change_done == Some(false) {
            return Some(PasswordAdvice::FirstChange);
        }
        let changed = self.last_password_change.as_deref().and_then(parse_timestamp)?;
        let elapsed = now.signed_duration_since(changed).abs();
        // Partial days count as a full day.
        let days = (elapsed.num_seconds() + 86_399) / 86_400;
        (days > PASSWORD_MAX_AGE_DAYS).then_some(PasswordAdvice::Stale { days })
    }
}

/// Accept RFC 3339, `YYYY-MM-DD HH:MM:SS` and bare dates (taken as UTC).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|n| n.and_utc())
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginResponse {
    pub user: UserProfile,
    #[serde(deserialize_with = "lenient::text")]
    pub token: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageResponse {
    #[serde(default, deserialize_with = "lenient::text")]
    pub message: String,
}

// ---------------------------------------------------------------------------
// Search
// ---------------------------------------------------------------------------

/// One entity's answer to a document-number search.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TaxpayerMatch {
    #[serde(rename = "nom_eje", default, deserialize_with = "lenient::text")]
    pub entity_name: String,
    #[serde(rename = "nom_com", default, deserialize_with = "lenient::text")]
    pub taxpayer_name: String,
    #[serde(rename = "nro_doc", default, deserialize_with = "lenient::text")]
    pub document_number: String,
    #[serde(rename = "imp_deu", default, deserialize_with = "lenient::amount")]
    pub outstanding_debt: f64,
    #[serde(rename = "ide_cnt", default)]
    pub connection_id: Option<Ident>,
    #[serde(rename = "ide_bde", default)]
    pub external_db_id: Option<Ident>,
}

impl TaxpayerMatch {
    pub fn connection(&self) -> ConnectionParams {
        ConnectionParams {
            pide_cnt: self.connection_id.clone(),
            ide_bde: self.external_db_id.clone(),
        }
    }
}

/// Routing keys for sub-ledger queries, in the shape the backend expects.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ConnectionParams {
    pub pide_cnt: Option<Ident>,
    pub ide_bde: Option<Ident>,
}

// ---------------------------------------------------------------------------
// Sub-ledgers
// ---------------------------------------------------------------------------

/// Sworn property-tax declaration (DDJJ).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Declaration {
    #[serde(default)]
    pub ide_dec: Option<Ident>,
    #[serde(default)]
    pub ide_eje: Option<Ident>,
    #[serde(rename = "ano_eje", default, deserialize_with = "lenient::text")]
    pub year: String,
    #[serde(rename = "nro_dec", default, deserialize_with = "lenient::text")]
    pub number: String,
    #[serde(rename = "fch_dec", default, deserialize_with = "lenient::opt_text")]
    pub date: Option<String>,
    #[serde(rename = "des_mot", default, deserialize_with = "lenient::text")]
    pub reason: String,
    #[serde(rename = "arr_des_reg", default, deserialize_with = "lenient::text")]
    pub regimes: String,
    #[serde(rename = "cnt_anx", default, deserialize_with = "lenient::text")]
    pub annex_count: String,
    #[serde(rename = "bas_dec", default, deserialize_with = "lenient::amount")]
    pub declared_base: f64,
    #[serde(rename = "bas_imp", default, deserialize_with = "lenient::amount")]
    pub taxable_base: f64,
    #[serde(rename = "imp_pre", default, deserialize_with = "lenient::amount")]
    pub assessed: f64,
    #[serde(rename = "val_tot", default, deserialize_with = "lenient::amount")]
    pub total: f64,
    #[serde(rename = "imp_pag", default, deserialize_with = "lenient::amount")]
    pub paid: f64,
    #[serde(rename = "imp_sld", default, deserialize_with = "lenient::amount")]
    pub balance: f64,
    #[serde(rename = "flg_anu", default, deserialize_with = "lenient::flag")]
    pub cancelled: bool,
}

/// Cashier receipt group as the backend pre-groups it.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ReceiptGroup {
    #[serde(default)]
    pub ide_rcg: Option<Ident>,
    #[serde(rename = "ser_gru", default, deserialize_with = "lenient::text")]
    pub series: String,
    #[serde(rename = "fch_hra_rcg", default, deserialize_with = "lenient::opt_text")]
    pub issued_at: Option<String>,
    /// Upstream total. Never used for display; see `aggregate::aggregate_receipts`.
    #[serde(rename = "total", default, deserialize_with = "lenient::amount")]
    pub reported_total: f64,
    #[serde(rename = "recibos", default)]
    pub receipts: Vec<Receipt>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Receipt {
    #[serde(default)]
    pub ide_rec: Option<Ident>,
    #[serde(rename = "nro_rec", default, deserialize_with = "lenient::text")]
    pub number: String,
    #[serde(rename = "fch_emi", default, deserialize_with = "lenient::opt_text")]
    pub issued_on: Option<String>,
    #[serde(rename = "gls_rec", default, deserialize_with = "lenient::opt_text")]
    pub memo: Option<String>,
    #[serde(rename = "flg_anu_rec", default, deserialize_with = "lenient::flag")]
    pub cancelled: bool,
    #[serde(rename = "total", default, deserialize_with = "lenient::amount")]
    pub reported_total: f64,
    #[serde(rename = "detalle", default)]
    pub line_items: Vec<LineItem>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LineItem {
    #[serde(rename = "des_itm", default, deserialize_with = "lenient::text")]
    pub description: String,
    #[serde(rename = "val_tot", default, deserialize_with = "lenient::amount")]
    pub amount: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct VehicleTax {
    #[serde(default)]
    pub ide_i_v: Option<Ident>,
    #[serde(rename = "ano_eje", default, deserialize_with = "lenient::text")]
    pub year: String,
    #[serde(rename = "nro_i_v", default, deserialize_with = "lenient::text")]
    pub number: String,
    #[serde(rename = "fch_dec", default, deserialize_with = "lenient::opt_text")]
    pub declared_on: Option<String>,
    #[serde(rename = "pla_veh", default, deserialize_with = "lenient::text")]
    pub plate: String,
    #[serde(rename = "doc_cnt", default, deserialize_with = "lenient::text")]
    pub owner_document: String,
    #[serde(rename = "nom_cnt", default, deserialize_with = "lenient::text")]
    pub owner_name: String,
    #[serde(rename = "flg_anu", default, deserialize_with = "lenient::flag")]
    pub cancelled: bool,
    #[serde(rename = "flg_liq", default, deserialize_with = "lenient::flag")]
    pub settled: bool,
    #[serde(rename = "imp_imp", default, deserialize_with = "lenient::amount")]
    pub tax: f64,
    #[serde(rename = "imp_deu", default, deserialize_with = "lenient::amount")]
    pub debt: f64,
    #[serde(rename = "imp_pag", default, deserialize_with = "lenient::amount")]
    pub paid: f64,
    #[serde(rename = "imp_sld", default, deserialize_with = "lenient::amount")]
    pub balance: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CadastralDocument {
    #[serde(rename = "nro_i_d", default, deserialize_with = "lenient::text")]
    pub number: String,
    #[serde(rename = "nom_doc", default, deserialize_with = "lenient::text")]
    pub name: String,
    #[serde(rename = "ano_eje", default, deserialize_with = "lenient::text")]
    pub year: String,
    #[serde(rename = "fch_d_c", default, deserialize_with = "lenient::opt_text")]
    pub date: Option<String>,
    #[serde(rename = "des_via", default, deserialize_with = "lenient::text")]
    pub street: String,
    #[serde(rename = "dom_esp", default, deserialize_with = "lenient::text")]
    pub address_detail: String,
    #[serde(rename = "sig_laa", default, deserialize_with = "lenient::text")]
    pub signatory: String,
    #[serde(rename = "flg_cer_fir", default, deserialize_with = "lenient::flag")]
    pub digitally_signed: bool,
    #[serde(rename = "url_q_r", default, deserialize_with = "lenient::opt_text")]
    pub signed_path: Option<String>,
    #[serde(rename = "doc_sin_fir", default, deserialize_with = "lenient::opt_text")]
    pub unsigned_archive: Option<String>,
}

/// How a cadastral document can be viewed.
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentSource<'a> {
    Signed { path: &'a str },
    Archive { base64: &'a str },
    Unavailable(&'static str),
}

impl CadastralDocument {
    pub fn source(&self) -> DocumentSource<'_> {
        fn non_empty(s: &Option<String>) -> Option<&str> {
            s.as_deref().filter(|v| !v.trim().is_empty())
        }
        if self.digitally_signed {
            match non_empty(&self.signed_path) {
                Some(path) => DocumentSource::Signed { path },
                None => DocumentSource::Unavailable(
                    "the document is marked as signed but has no URL",
                ),
            }
        } else {
            match non_empty(&self.unsigned_archive) {
                Some(base64) => DocumentSource::Archive { base64 },
                None => DocumentSource::Unavailable("no file is available for this document"),
            }
        }
    }
}

/// Property-transfer tax record. Only the identifiers used for reports are
/// typed; the remaining columns vary by municipality and are shown as-is.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Alcabala {
    #[serde(default)]
    pub ide_alc: Option<Ident>,
    #[serde(rename = "ano_eje", default, deserialize_with = "lenient::text")]
    pub year: String,
    #[serde(flatten)]
    pub columns: Map<String, Value>,
}

/// Signature metadata returned by the extraction service; shown verbatim.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SignatureResponse {
    #[serde(default)]
    pub signature: Option<Value>,
}

// ---------------------------------------------------------------------------
// Administration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ManagedUser {
    pub id: Ident,
    #[serde(rename = "nom_usu", default, deserialize_with = "lenient::text")]
    pub name: String,
    #[serde(rename = "cor_ele", default, deserialize_with = "lenient::text")]
    pub email: String,
    #[serde(rename = "flg_adm", default, deserialize_with = "lenient::flag")]
    pub is_admin: bool,
    #[serde(rename = "act_ina", default, deserialize_with = "lenient::flag")]
    pub active: bool,
    #[serde(rename = "fch_cre", default, deserialize_with = "lenient::opt_text")]
    pub created_at: Option<String>,
    #[serde(rename = "fch_cam_psw", default, deserialize_with = "lenient::opt_text")]
    pub password_changed_at: Option<String>,
    #[serde(rename = "ide_not_sol_ser", default)]
    pub organization_id: Option<Ident>,
}

/// National-ID lookup result used when registering a collaborator.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Person {
    pub ide_per: Ident,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Person {
    pub fn display_name(&self) -> String {
        for key in ["nom_com", "nom_per", "nombre"] {
            if let Some(Value::String(s)) = self.fields.get(key) {
                if !s.trim().is_empty() {
                    return s.clone();
                }
            }
        }
        let parts: Vec<&str> = ["nom_pri", "ape_pat", "ape_mat"]
            .iter()
            .filter_map(|k| self.fields.get(*k).and_then(Value::as_str))
            .filter(|s| !s.trim().is_empty())
            .collect();
        parts.join(" ")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NewUser {
    pub ide_per: Ident,
    pub cor_ele: String,
    pub flg_adm: u8,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::decode;
    use chrono::TimeZone;
    use serde_json::json;

    fn profile(json: Value) -> UserProfile {
        decode(json).unwrap()
    }

    #[test]
    fn profile_roundtrips_unknown_fields_and_flags() {
        let p = profile(json!({
            "NOM_COM": "Notaria Quispe", "cor_ele": "a@b.pe", "flg_adm": "1",
            "flg_cam_psw": 0, "logo_url": "https://x/logo.png"
        }));
        assert!(p.is_admin);
        assert_eq!(p.first_change_done, Some(false));
        let back = serde_json::to_value(&p).unwrap();
        assert_eq!(back["flg_adm"], json!(1));
        assert_eq!(back["flg_cam_psw"], json!(0));
        assert_eq!(back["logo_url"], json!("https://x/logo.png"));
        assert_eq!(back["nom_com"], json!("Notaria Quispe"));
    }

    #[test]
    fn first_change_advice_wins() {
        let p = profile(json!({"flg_cam_psw": 0, "fch_cam_psw": null}));
        assert_eq!(p.password_advice(Utc::now()), Some(PasswordAdvice::FirstChange));
    }

    #[test]
    fn missing_or_null_flag_gives_no_first_change_advice() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let missing = profile(json!({"nom_com": "X"}));
        assert_eq!(missing.first_change_done, None);
        assert_eq!(missing.password_advice(now), None);
        let null = profile(json!({"nom_com": "X", "flg_cam_psw": null}));
        assert_eq!(null.password_advice(now), None);
        let back = serde_json::to_value(&null).unwrap();
        assert!(back.get("flg_cam_psw").is_none());
        let stale = profile(json!({"fch_cam_psw": "2025-01-01"}));
        assert!(matches!(stale.password_advice(now), Some(PasswordAdvice::Stale { .. })));
    }

    #[test]
    fn stale_password_after_sixty_days() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let stale = profile(json!({"flg_cam_psw": 1, "fch_cam_psw": "2025-03-01T12:00:00Z"}));
        assert_eq!(stale.password_advice(now), Some(PasswordAdvice::Stale { days: 92 }));
        let fresh = profile(json!({"flg_cam_psw": 1, "fch_cam_psw": "2025-05-20"}));
        assert_eq!(fresh.password_advice(now), None);
        let unknown = profile(json!({"flg_cam_psw": 1}));
        assert_eq!(unknown.password_advice(now), None);
    }

    #[test]
    fn taxpayer_match_builds_connection_params() {
        let m: TaxpayerMatch = decode(json!({
            "NOM_EJE": "MUNI LIMA", "Ide_Cnt": 15, "IDE_BDE": "7", "imp_deu": "-"
        }))
        .unwrap();
        assert_eq!(m.outstanding_debt, 0.0);
        let params = serde_json::to_value(m.connection()).unwrap();
        assert_eq!(params, json!({"pide_cnt": 15, "ide_bde": "7"}));
    }

    #[test]
    fn cadastral_source_selection() {
        let signed: CadastralDocument =
            decode(json!({"flg_cer_fir": "1", "url_q_r": "/qr?id=5"})).unwrap();
        assert_eq!(signed.source(), DocumentSource::Signed { path: "/qr?id=5" });
        let archive: CadastralDocument = decode(json!({"flg_cer_fir": 0, "doc_sin_fir": "UEsDB"})).unwrap();
        assert_eq!(archive.source(), DocumentSource::Archive { base64: "UEsDB" });
        let broken: CadastralDocument = decode(json!({"flg_cer_fir": 1, "url_q_r": ""})).unwrap();
        assert!(matches!(broken.source(), DocumentSource::Unavailable(_)));
        let blank: CadastralDocument = decode(json!({"flg_cer_fir": 0, "doc_sin_fir": "  "})).unwrap();
        assert!(matches!(blank.source(), DocumentSource::Unavailable(_)));
    }

    #[test]
    fn person_display_name_falls_back_to_parts() {
        let p: Person = decode(json!({"ide_per": 3, "nom_pri": "ANA", "ape_pat": "ROJAS"})).unwrap();
        assert_eq!(p.display_name(), "ANA ROJAS");
    }
}
