use colored::Colorize;
use comfy_table::{Cell, Table};

use super::{client_for, context, require};
use crate::aggregate::{group_by_entity, summarize_search};
use crate::error::Result;
use crate::fmt::money;
use crate::guard::Route;
use crate::models::TaxpayerMatch;

pub const NO_INFORMATION: &str = "This DNI / RUC has no information on this platform.";

pub fn run(document: &str, entity: Option<&str>, group: bool) -> Result<()> {
    let (settings, store) = context();
    let session = require(&store, Route::Dashboard)?;
    let matches = client_for(&settings, &session)?.search_by_document(document)?;

    if matches.is_empty() {
        println!("{}", NO_INFORMATION.yellow());
        return Ok(());
    }

    let summary = summarize_search(&matches, entity.unwrap_or(""));
    if summary.rows.is_empty() {
        println!("No entity matches {:?}.", entity.unwrap_or(""));
        return Ok(());
    }

    if let Some(first) = summary.rows.first() {
        println!(
            "{} {}  ({})",
            "Taxpayer:".bold(),
            first.taxpayer_name,
            first.document_number
        );
    }

    if group {
        for g in group_by_entity(summary.rows.clone()) {
            println!("\n{}", g.display_name.bold());
            println!("{}", match_table(&g.members));
        }
    } else {
        println!("{}", match_table(&summary.rows));
    }
    println!(
        "{} records  Total debt {}",
        summary.rows.len(),
        money(summary.total_debt).bold()
    );
    Ok(())
}

fn match_table(rows: &[TaxpayerMatch]) -> Table {
    let mut table = Table::new();
    table.set_header(vec!["Entity", "Taxpayer", "Debt", "--cnt", "--bde"]);
    for m in rows {
        let debt = if m.outstanding_debt > 0.0 {
            money(m.outstanding_debt).red().to_string()
        } else {
            money(m.outstanding_debt).green().to_string()
        };
        table.add_row(vec![
            Cell::new(&m.entity_name),
            Cell::new(&m.taxpayer_name),
            Cell::new(debt),
            Cell::new(m.connection_id.as_ref().map(|i| i.key()).unwrap_or_default()),
            Cell::new(m.external_db_id.as_ref().map(|i| i.key()).unwrap_or_default()),
        ]);
    }
    table
}
