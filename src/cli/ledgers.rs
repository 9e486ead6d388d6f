use std::path::PathBuf;

use colored::Colorize;
use comfy_table::{Cell, Table};
use serde_json::Value;
use tracing::warn;

use super::{client_for, context, require, ConnectionArgs};
use crate::aggregate::{
    aggregate_receipts, declaration_totals, filter_declarations_by_year, receipts_grand_total,
    vehicle_totals, ReceiptFilter,
};
use crate::api::ApiClient;
use crate::error::{ConsultaError, Result};
use crate::fmt::{date, datetime, money, yes_no};
use crate::guard::Route;
use crate::models::{Alcabala, CadastralDocument, DocumentSource};
use crate::normalize::lenient::text_of;
use crate::normalize::Ident;
use crate::report::{
    alcabala_report, declaration_report, report_url, signed_document_url, ReportKind,
};
use crate::settings::{shellexpand_path, Settings};

pub fn ddjj(conn: &ConnectionArgs, year: Option<&str>, reports: bool) -> Result<()> {
    let (settings, store) = context();
    let session = require(&store, Route::Dashboard)?;
    let params = conn.params();
    let rows = client_for(&settings, &session)?.list_declarations(&params)?;
    let rows = filter_declarations_by_year(rows, year);
    if rows.is_empty() {
        println!("No declarations found.");
        return Ok(());
    }

    let mut table = Table::new();
    table.set_header(vec![
        "Year", "Number", "Date", "Reason", "Declared", "Taxable", "Total", "Paid", "Balance", "Cancelled",
    ]);
    for d in &rows {
        table.add_row(vec![
            Cell::new(&d.year),
            Cell::new(&d.number),
            Cell::new(date(d.date.as_deref())),
            Cell::new(&d.reason),
            Cell::new(money(d.declared_base)),
            Cell::new(money(d.taxable_base)),
            Cell::new(money(d.total)),
            Cell::new(money(d.paid)),
            Cell::new(money(d.balance)),
            Cell::new(yes_no(d.cancelled)),
        ]);
    }
    let totals = declaration_totals(&rows);
    table.add_row(vec![
        Cell::new("TOTAL".bold()),
        Cell::new(""),
        Cell::new(""),
        Cell::new(""),
        Cell::new(""),
        Cell::new(""),
        Cell::new(money(totals.debt)),
        Cell::new(money(totals.paid)),
        Cell::new(money(totals.balance)),
        Cell::new(""),
    ]);
    println!("Sworn declarations\n{table}");

    if reports {
        for d in &rows {
            match declaration_report(&settings.report_base_url, d, params.ide_bde.as_ref(), &session.token) {
                Ok(url) => println!("{} {}  {url}", d.year, d.number),
                Err(e) => println!("{} {}  {}", d.year, d.number, e.to_string().yellow()),
            }
        }
    }
    Ok(())
}

pub fn receipts(
    conn: &ConnectionArgs,
    year: Option<i32>,
    number: Option<String>,
    memo: Option<String>,
    detail: bool,
) -> Result<()> {
    let (settings, store) = context();
    let session = require(&store, Route::Dashboard)?;
    let groups = client_for(&settings, &session)?.list_receipts(&conn.params(), year)?;
    let filter = ReceiptFilter {
        number: number.unwrap_or_default(),
        memo: memo.unwrap_or_default(),
    };
    let summary = aggregate_receipts(groups, &filter);
    if summary.is_empty() {
        println!("No receipts found.");
        return Ok(());
    }

    for group in &summary {
        let count = group.receipts.len();
        println!(
            "\n{} {}  {}  {} {}  {}",
            "Series".bold(),
            group.series,
            datetime(group.issued_at.as_deref()),
            count,
            if count == 1 { "receipt" } else { "receipts" },
            money(group.total).bold()
        );
        let mut table = Table::new();
        table.set_header(vec!["Number", "Issued", "Memo", "Cancelled", "Total"]);
        for r in &group.receipts {
            let memo = r.receipt.memo.clone().unwrap_or_else(|| r.preview.clone());
            table.add_row(vec![
                Cell::new(&r.receipt.number),
                Cell::new(date(r.receipt.issued_on.as_deref())),
                Cell::new(memo),
                Cell::new(yes_no(r.receipt.cancelled)),
                Cell::new(money(r.total)),
            ]);
            if detail {
                if r.receipt.line_items.is_empty() {
                    table.add_row(vec!["", "", "  (no line items)", "", ""]);
                }
                for item in &r.receipt.line_items {
                    table.add_row(vec![
                        Cell::new(""),
                        Cell::new(""),
                        Cell::new(format!("  {}", item.description)),
                        Cell::new(""),
                        Cell::new(money(item.amount)),
                    ]);
                }
            }
        }
        println!("{table}");
    }
    println!("\nGrand total {}", money(receipts_grand_total(&summary)).bold());
    Ok(())
}

pub fn vehicles(conn: &ConnectionArgs) -> Result<()> {
    let (settings, store) = context();
    let session = require(&store, Route::Dashboard)?;
    let rows = client_for(&settings, &session)?.list_vehicle_taxes(&conn.params())?;
    if rows.is_empty() {
        println!("No vehicle tax records found.");
        return Ok(());
    }
    let mut table = Table::new();
    table.set_header(vec![
        "Year", "Number", "Declared", "Plate", "Owner", "Tax", "Debt", "Paid", "Balance", "Settled", "Cancelled",
    ]);
    for v in &rows {
        table.add_row(vec![
            Cell::new(&v.year),
            Cell::new(&v.number),
            Cell::new(date(v.declared_on.as_deref())),
            Cell::new(&v.plate),
            Cell::new(format!("{} {}", v.owner_document, v.owner_name).trim().to_string()),
            Cell::new(money(v.tax)),
            Cell::new(money(v.debt)),
            Cell::new(money(v.paid)),
            Cell::new(money(v.balance)),
            Cell::new(yes_no(v.settled)),
            Cell::new(yes_no(v.cancelled)),
        ]);
    }
    let t = vehicle_totals(&rows);
    table.add_row(vec![
        Cell::new("TOTAL".bold()),
        Cell::new(""),
        Cell::new(""),
        Cell::new(""),
        Cell::new(""),
        Cell::new(money(t.tax)),
        Cell::new(money(t.debt)),
        Cell::new(money(t.paid)),
        Cell::new(money(t.balance)),
        Cell::new(""),
        Cell::new(""),
    ]);
    println!("Vehicle tax\n{table}");
    Ok(())
}

pub fn cadastral(conn: &ConnectionArgs, open: Option<usize>) -> Result<()> {
    let (settings, store) = context();
    let session = require(&store, Route::Dashboard)?;
    let client = client_for(&settings, &session)?;
    let docs = client.list_cadastral_documents(&conn.params())?;
    if docs.is_empty() {
        println!("No cadastral documents found.");
        return Ok(());
    }

    if let Some(row) = open {
        let doc = row
            .checked_sub(1)
            .and_then(|i| docs.get(i))
            .ok_or_else(|| {
                ConsultaError::Validation(format!("row must be between 1 and {}", docs.len()))
            })?;
        return match fetch_document(&client, &settings, doc)? {
            DocumentOutcome::Signed { url, signature } => {
                println!("{} {url}", "Signed document:".bold());
                if let Some(sig) = signature {
                    println!("{}", serde_json::to_string_pretty(&sig)?);
                }
                Ok(())
            }
            DocumentOutcome::Saved { path } => {
                println!("{} {}", "Saved".green(), path.display());
                Ok(())
            }
        };
    }

    let mut table = Table::new();
    table.set_header(vec!["#", "Number", "Document", "Year", "Date", "Address", "Signed by", "Digital"]);
    for (i, d) in docs.iter().enumerate() {
        let address = format!("{} {}", d.street, d.address_detail).trim().to_string();
        table.add_row(vec![
            Cell::new(i + 1),
            Cell::new(&d.number),
            Cell::new(&d.name),
            Cell::new(&d.year),
            Cell::new(date(d.date.as_deref())),
            Cell::new(address),
            Cell::new(&d.signatory),
            Cell::new(yes_no(d.digitally_signed)),
        ]);
    }
    println!("Cadastral documents\n{table}");
    println!("Use --open <#> to fetch a document.");
    Ok(())
}

pub fn alcabala(conn: &ConnectionArgs, reports: bool) -> Result<()> {
    let (settings, store) = context();
    let session = require(&store, Route::Dashboard)?;
    let params = conn.params();
    let rows = client_for(&settings, &session)?.list_alcabala(&params)?;
    if rows.is_empty() {
        println!("No property transfer tax records found.");
        return Ok(());
    }
    let columns = alcabala_columns(&rows);
    let mut header = vec!["Year".to_string(), "Id".to_string()];
    header.extend(columns.iter().cloned());
    let mut table = Table::new();
    table.set_header(header);
    for r in &rows {
        let mut cells = vec![
            Cell::new(&r.year),
            Cell::new(r.ide_alc.as_ref().map(|i| i.key()).unwrap_or_default()),
        ];
        for c in &columns {
            let text = r.columns.get(c).and_then(text_of).unwrap_or_default();
            cells.push(Cell::new(text));
        }
        table.add_row(cells);
    }
    println!("Property transfer tax\n{table}");

    if reports {
        for r in &rows {
            match alcabala_report(&settings.report_base_url, r, params.ide_bde.as_ref(), &session.token) {
                Ok(url) => println!("{}  {url}", r.year),
                Err(e) => println!("{}  {}", r.year, e.to_string().yellow()),
            }
        }
    }
    Ok(())
}

/// Print the report URL for a record whose ids are already known.
pub fn report(kind: &str, id: &str, period: &str, bde: Option<&str>) -> Result<()> {
    let kind = ReportKind::parse(kind).ok_or_else(|| {
        ConsultaError::Validation(format!("unknown report kind {kind:?}; use ddjj or alcabala"))
    })?;
    let (settings, store) = context();
    let session = require(&store, Route::Dashboard)?;
    let bde = bde.map(Ident::parse);
    let url = report_url(
        &settings.report_base_url,
        kind,
        &Ident::parse(id),
        &Ident::parse(period),
        bde.as_ref(),
        &session.token,
    )?;
    println!("{url}");
    Ok(())
}

/// Column names across all rows, nested values excluded.
pub(crate) fn alcabala_columns(rows: &[Alcabala]) -> Vec<String> {
    let mut columns: Vec<String> = Vec::new();
    for r in rows {
        for (k, v) in &r.columns {
            if matches!(v, Value::Object(_) | Value::Array(_)) {
                continue;
            }
            if !columns.contains(k) {
                columns.push(k.clone());
            }
        }
    }
    columns
}

#[derive(Debug)]
pub(crate) enum DocumentOutcome {
    Signed { url: String, signature: Option<Value> },
    Saved { path: PathBuf },
}

/// View one cadastral document: signed rows resolve to their URL plus any
/// signature metadata; unsigned rows are converted and written to disk.
pub(crate) fn fetch_document(
    client: &ApiClient,
    settings: &Settings,
    doc: &CadastralDocument,
) -> Result<DocumentOutcome> {
    match doc.source() {
        DocumentSource::Signed { path } => {
            let token = client.token().unwrap_or_default();
            let url = signed_document_url(&settings.qr_base_url, path, token)?;
            let signature = match client.extract_signature(&url) {
                Ok(sig) => sig,
                Err(e) if e.is_session_expired() => return Err(e),
                Err(e) => {
                    warn!(error = %e, "signature extraction failed; showing the document anyway");
                    None
                }
            };
            Ok(DocumentOutcome::Signed { url, signature })
        }
        DocumentSource::Archive { base64 } => {
            let bytes = client.archive_to_pdf(base64)?;
            let dir = PathBuf::from(shellexpand_path(&settings.download_dir));
            std::fs::create_dir_all(&dir)?;
            let path = dir.join(document_file_name(doc));
            std::fs::write(&path, bytes)?;
            Ok(DocumentOutcome::Saved { path })
        }
        DocumentSource::Unavailable(reason) => {
            Err(ConsultaError::Other(format!("Document unavailable: {reason}")))
        }
    }
}

fn document_file_name(doc: &CadastralDocument) -> String {
    let stem: String = format!("{}-{}", doc.year, doc.number)
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    format!("cadastral-{}.pdf", stem.trim_matches('-'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::client::testing::serve_once;
    use crate::normalize::{decode, decode_list};
    use serde_json::json;

    #[test]
    fn alcabala_columns_are_unioned_without_nested_values() {
        let rows: Vec<Alcabala> = decode_list(json!([
            {"ide_alc": 1, "ano_eje": 2020, "val_tra": 10, "extra": {"a": 1}},
            {"ide_alc": 2, "ano_eje": 2021, "nom_tra": "X", "val_tra": 5},
        ]))
        .unwrap();
        assert_eq!(alcabala_columns(&rows), vec!["val_tra".to_string(), "nom_tra".to_string()]);
    }

    #[test]
    fn file_names_are_sanitised() {
        let doc: CadastralDocument = decode(json!({"ano_eje": 2023, "nro_i_d": "12/A"})).unwrap();
        assert_eq!(document_file_name(&doc), "cadastral-2023-12_A.pdf");
    }

    #[test]
    fn unsigned_document_is_saved_to_download_dir() {
        let dir = tempfile::tempdir().unwrap();
        let (mut settings, server) = serve_once("200 OK", "application/pdf", b"%PDF-1.7".to_vec());
        settings.download_dir = dir.path().to_string_lossy().to_string();
        let client = ApiClient::new(&settings, Some("t".into())).unwrap();
        let doc: CadastralDocument =
            decode(json!({"flg_cer_fir": 0, "doc_sin_fir": "UEsDBA==", "ano_eje": 2024, "nro_i_d": 7})).unwrap();
        match fetch_document(&client, &settings, &doc).unwrap() {
            DocumentOutcome::Saved { path } => {
                assert_eq!(std::fs::read(&path).unwrap(), b"%PDF-1.7");
                assert!(path.starts_with(dir.path()));
            }
            DocumentOutcome::Signed { .. } => panic!("expected a saved file"),
        }
        server.join().unwrap();
    }

    #[test]
    fn signature_failure_is_not_fatal() {
        let (mut settings, server) = serve_once("500 Internal Server Error", "text/plain", b"x".to_vec());
        settings.qr_base_url = "https://qr.example".to_string();
        let client = ApiClient::new(&settings, Some("tok".into())).unwrap();
        let doc: CadastralDocument = decode(json!({"flg_cer_fir": 1, "url_q_r": "/d?id=3"})).unwrap();
        match fetch_document(&client, &settings, &doc).unwrap() {
            DocumentOutcome::Signed { url, signature } => {
                assert_eq!(url, "https://qr.example/d?id=3&token=tok");
                assert!(signature.is_none());
            }
            DocumentOutcome::Saved { .. } => panic!("expected a signed document"),
        }
        server.join().unwrap();
    }

    #[test]
    fn expired_session_during_signature_check_is_reported() {
        let (mut settings, server) =
            serve_once("401 Unauthorized", "application/json", br#"{"message":"x"}"#.to_vec());
        settings.qr_base_url = "https://qr.example".to_string();
        let client = ApiClient::new(&settings, Some("tok".into())).unwrap();
        let doc: CadastralDocument = decode(json!({"flg_cer_fir": 1, "url_q_r": "/d?id=3"})).unwrap();
        let err = fetch_document(&client, &settings, &doc).unwrap_err();
        assert!(err.is_session_expired());
        server.join().unwrap();
    }

    #[test]
    fn document_without_file_is_unavailable() {
        let settings = Settings::default();
        let client = ApiClient::new(&settings, Some("t".into())).unwrap();
        let doc: CadastralDocument = decode(json!({"flg_cer_fir": 0})).unwrap();
        assert!(fetch_document(&client, &settings, &doc).is_err());
    }
}
