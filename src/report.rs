use reqwest::Url;
use serde_json::{json, Value};

use crate::error::{ConsultaError, Result};
use crate::models::{Alcabala, Declaration};
use crate::normalize::Ident;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    Declaration,
    Alcabala,
}

impl ReportKind {
    pub fn process_code(self) -> &'static str {
        match self {
            ReportKind::Declaration => "SIAM_DEC_CAB",
            ReportKind::Alcabala => "SIAM_ALC_CAB",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "ddjj" | "declaration" => Some(ReportKind::Declaration),
            "alcabala" => Some(ReportKind::Alcabala),
            _ => None,
        }
    }
}

/// URL of the rendered report for one record. The service reads a JSON
/// `data` parameter plus the caller's token and external database id.
pub fn report_url(
    report_base: &str,
    kind: ReportKind,
    id: &Ident,
    period: &Ident,
    ide_bde: Option<&Ident>,
    token: &str,
) -> Result<String> {
    let data = json!({
        "arr_ide_dec": [id.as_value()],
        "cod_pro": kind.process_code(),
        "ide_eje": period.as_value(),
    });
    let base = format!("{}/reportes", report_base.trim_end_matches('/'));
    let mut url = Url::parse(&base)
        .map_err(|e| ConsultaError::Settings(format!("invalid report_base_url {base:?}: {e}")))?;
    let ide_bde = ide_bde.map(Ident::key).unwrap_or_else(|| "null".to_string());
    url.query_pairs_mut()
        .append_pair("data", &data.to_string())
        .append_pair("token", token)
        .append_pair("ide_bde", &ide_bde);
    Ok(url.to_string())
}

pub fn declaration_report(
    report_base: &str,
    decl: &Declaration,
    ide_bde: Option<&Ident>,
    token: &str,
) -> Result<String> {
    let id = decl
        .ide_dec
        .as_ref()
        .ok_or_else(|| ConsultaError::Validation("declaration has no ide_dec".to_string()))?;
    let period = decl
        .ide_eje
        .clone()
        .unwrap_or_else(|| Ident::new(Value::Null));
    report_url(report_base, ReportKind::Declaration, id, &period, ide_bde, token)
}

pub fn alcabala_report(
    report_base: &str,
    row: &Alcabala,
    ide_bde: Option<&Ident>,
    token: &str,
) -> Result<String> {
    let id = row
        .ide_alc
        .as_ref()
        .ok_or_else(|| ConsultaError::Validation("alcabala record has no ide_alc".to_string()))?;
    report_url(
        report_base,
        ReportKind::Alcabala,
        id,
        &Ident::parse(&row.year),
        ide_bde,
        token,
    )
}

/// Full URL of a digitally signed cadastral document. `path` already carries
/// its own query string; the token is added as one more encoded pair.
pub fn signed_document_url(qr_base: &str, path: &str, token: &str) -> Result<String> {
    let mut url = Url::parse(&format!("{qr_base}{path}"))
        .map_err(|e| ConsultaError::Settings(format!("invalid document URL {qr_base}{path}: {e}")))?;
    url.query_pairs_mut().append_pair("token", token);
    Ok(url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::decode;

    fn query(url: &str) -> Vec<(String, String)> {
        Url::parse(url)
            .unwrap()
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    }

    #[test]
    fn declaration_report_carries_json_payload() {
        let url = report_url(
            "https://documentosvirtuales.com/",
            ReportKind::Declaration,
            &Ident::new(5501),
            &Ident::new(2024),
            Some(&Ident::new("12")),
            "tok",
        )
        .unwrap();
        assert!(url.starts_with("https://documentosvirtuales.com/reportes?data="));
        let pairs = query(&url);
        let data: Value = serde_json::from_str(&pairs[0].1).unwrap();
        assert_eq!(
            data,
            json!({"arr_ide_dec": [5501], "cod_pro": "SIAM_DEC_CAB", "ide_eje": 2024})
        );
        assert_eq!(pairs[1], ("token".to_string(), "tok".to_string()));
        assert_eq!(pairs[2], ("ide_bde".to_string(), "12".to_string()));
    }

    #[test]
    fn alcabala_uses_its_own_process_code() {
        let row: Alcabala = decode(json!({"IDE_ALC": "A9", "ANO_EJE": 2023, "val_tra": 1})).unwrap();
        let url = alcabala_report("https://r.example", &row, None, "t").unwrap();
        let pairs = query(&url);
        let data: Value = serde_json::from_str(&pairs[0].1).unwrap();
        assert_eq!(data["cod_pro"], "SIAM_ALC_CAB");
        assert_eq!(data["arr_ide_dec"], json!(["A9"]));
        assert_eq!(data["ide_eje"], json!(2023));
        assert_eq!(pairs[2].1, "null");
    }

    #[test]
    fn declaration_without_id_is_rejected() {
        let decl: Declaration = decode(json!({"ide_eje": 2020})).unwrap();
        assert!(matches!(
            declaration_report("https://r.example", &decl, None, "t"),
            Err(ConsultaError::Validation(_))
        ));
    }

    #[test]
    fn bad_base_url_is_a_settings_error() {
        let err = report_url("not a url", ReportKind::Declaration, &Ident::new(1), &Ident::new(1), None, "")
            .unwrap_err();
        assert!(matches!(err, ConsultaError::Settings(_)));
    }

    #[test]
    fn signed_document_url_appends_token() {
        assert_eq!(
            signed_document_url("https://qr.example", "/doc?id=7", "abc").unwrap(),
            "https://qr.example/doc?id=7&token=abc"
        );
    }

    #[test]
    fn signed_document_token_is_query_encoded() {
        let url = signed_document_url("https://qr.example", "/doc?id=7", "a&b c=").unwrap();
        assert_eq!(url, "https://qr.example/doc?id=7&token=a%26b+c%3D");
        let pairs: Vec<(String, String)> = Url::parse(&url)
            .unwrap()
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert_eq!(pairs[1], ("token".to_string(), "a&b c=".to_string()));
    }

    #[test]
    fn report_kind_parse() {
        assert_eq!(ReportKind::parse("DDJJ"), Some(ReportKind::Declaration));
        assert_eq!(ReportKind::parse("alcabala"), Some(ReportKind::Alcabala));
        assert_eq!(ReportKind::parse("x"), None);
    }
}
