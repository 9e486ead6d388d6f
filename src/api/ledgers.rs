use serde::Serialize;
use serde_json::Value;

use super::ApiClient;
use crate::error::{ConsultaError, Result};
use crate::models::{
    Alcabala, CadastralDocument, ConnectionParams, Declaration, ReceiptGroup, VehicleTax,
};
use crate::normalize::{decode, decode_list, Ident, ReceiptsEnvelope};

#[derive(Serialize)]
struct ReceiptsQuery<'a> {
    #[serde(flatten)]
    connection: &'a ConnectionParams,
    /// `null` asks for every year.
    pano_eje: Option<String>,
}

impl ApiClient {
    pub fn list_declarations(&self, conn: &ConnectionParams) -> Result<Vec<Declaration>> {
        let value = self.post_json("/api/ddjj/list", conn, "Could not load declarations")?;
        decode_list(value)
    }

    pub fn list_receipts(
        &self,
        conn: &ConnectionParams,
        year: Option<i32>,
    ) -> Result<Vec<ReceiptGroup>> {
        let query = ReceiptsQuery {
            connection: conn,
            pano_eje: year.map(|y| y.to_string()),
        };
        let value = self.post_json("/api/recibos/list", &query, "Could not load cashier receipts")?;
        let groups = ReceiptsEnvelope::classify(value)?.into_groups()?;
        groups.into_iter().map(decode).collect()
    }

    pub fn list_cadastral_documents(
        &self,
        conn: &ConnectionParams,
    ) -> Result<Vec<CadastralDocument>> {
        let value = self.post_json(
            "/api/catastro/list",
            conn,
            "Could not load cadastral documents",
        )?;
        decode_list(value)
    }

    pub fn list_vehicle_taxes(&self, conn: &ConnectionParams) -> Result<Vec<VehicleTax>> {
        let cnt = required(conn.pide_cnt.as_ref(), "connection id")?;
        let bde = required(conn.ide_bde.as_ref(), "external database id")?;
        let path = format!(
            "/api/impuesto-vehicular/{}/{}",
            urlencoding::encode(&cnt.key()),
            urlencoding::encode(&bde.key())
        );
        let value = self.get_json(&path, "Could not load vehicle tax records")?;
        decode_list(value)
    }

    pub fn list_alcabala(&self, conn: &ConnectionParams) -> Result<Vec<Alcabala>> {
        let value = self.post_json(
            "/api/alcabala/list",
            conn,
            "Could not load property transfer tax records",
        )?;
        decode_list(value)
    }
}

fn required<'a>(id: Option<&'a Ident>, what: &str) -> Result<&'a Ident> {
    match id {
        Some(id) if !id.key().is_empty() && id.as_value() != &Value::Null => Ok(id),
        _ => Err(ConsultaError::Validation(format!("missing {what}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::client::testing::serve_json;
    use crate::aggregate::{aggregate_receipts, ReceiptFilter};
    use serde_json::json;

    fn conn() -> ConnectionParams {
        ConnectionParams {
            pide_cnt: Some(Ident::new(15)),
            ide_bde: Some(Ident::new("7")),
        }
    }

    fn client(settings: &crate::settings::Settings) -> ApiClient {
        ApiClient::new(settings, Some("t".into())).unwrap()
    }

    #[test]
    fn declarations_post_connection_params() {
        let (settings, server) = serve_json("200 OK", r#"[{"IDE_DEC": 1, "VAL_TOT": "100.00"}]"#);
        let rows = client(&settings).list_declarations(&conn()).unwrap();
        assert_eq!(rows[0].total, 100.0);
        let req = server.join().unwrap();
        assert_eq!(req.request_line, "POST /api/ddjj/list HTTP/1.1");
        assert_eq!(req.json(), json!({"pide_cnt": 15, "ide_bde": "7"}));
    }

    #[test]
    fn receipts_triple_wrapped_shape_is_normalised() {
        let inner = r#"[{"ide_rcg": 1, "total": 999, "recibos": [{"nro_rec": "R-1", "detalle": [{"val_tot": "10.10"}, {"val_tot": 5}]}]}]"#;
        let body = serde_json::to_string(&json!([inner])).unwrap();
        let (settings, server) = serve_json("200 OK", &body);
        let groups = client(&settings).list_receipts(&conn(), Some(2024)).unwrap();
        let req = server.join().unwrap();
        assert_eq!(req.json()["pano_eje"], json!("2024"));
        let summary = aggregate_receipts(groups, &ReceiptFilter::default());
        assert_eq!(summary.len(), 1);
        assert_eq!(summary[0].total, 15.1);
    }

    #[test]
    fn receipts_without_year_send_null() {
        let (settings, server) = serve_json("200 OK", "null");
        let groups = client(&settings).list_receipts(&conn(), None).unwrap();
        assert!(groups.is_empty());
        assert_eq!(server.join().unwrap().json()["pano_eje"], Value::Null);
    }

    #[test]
    fn vehicle_taxes_use_path_parameters() {
        let (settings, server) = serve_json("200 OK", r#"[{"PLA_VEH": "ABC-123", "IMP_IMP": 50}]"#);
        let rows = client(&settings).list_vehicle_taxes(&conn()).unwrap();
        assert_eq!(rows[0].plate, "ABC-123");
        let req = server.join().unwrap();
        assert_eq!(req.request_line, "GET /api/impuesto-vehicular/15/7 HTTP/1.1");
    }

    #[test]
    fn vehicle_taxes_need_both_ids() {
        let err = client(&crate::settings::Settings::default())
            .list_vehicle_taxes(&ConnectionParams::default())
            .unwrap_err();
        assert!(matches!(err, ConsultaError::Validation(_)));
    }

    #[test]
    fn alcabala_keeps_unknown_columns() {
        let (settings, server) = serve_json("200 OK", r#"[{"IDE_ALC": 4, "ANO_EJE": "2022", "NOM_TRA": "X"}]"#);
        let rows = client(&settings).list_alcabala(&conn()).unwrap();
        server.join().unwrap();
        assert_eq!(rows[0].year, "2022");
        assert_eq!(rows[0].columns.get("nom_tra"), Some(&json!("X")));
    }

    #[test]
    fn vehicle_tax_ids_are_escaped_in_the_path() {
        let (settings, server) = serve_json("200 OK", "[]");
        let conn = ConnectionParams {
            pide_cnt: Some(Ident::new("a/b c")),
            ide_bde: Some(Ident::new("007")),
        };
        assert!(client(&settings).list_vehicle_taxes(&conn).unwrap().is_empty());
        let req = server.join().unwrap();
        assert_eq!(req.request_line, "GET /api/impuesto-vehicular/a%2Fb%20c/007 HTTP/1.1");
    }
}
