use std::collections::HashMap;

use crate::error::{ConsultaError, Result};
use crate::fmt::truncate;
use crate::models::{
    Declaration, ManagedUser, Receipt, ReceiptGroup, TaxpayerMatch, VehicleTax,
};
use crate::normalize::Ident;

// ---------------------------------------------------------------------------
// Currency accumulation
// ---------------------------------------------------------------------------

fn to_cents(amount: f64) -> i64 {
    if amount.is_finite() {
        (amount * 100.0).round() as i64
    } else {
        0
    }
}

/// Sum currency amounts in whole cents so totals don't drift (0.1 + 0.2 == 0.3).
pub fn sum_amounts<I: IntoIterator<Item = f64>>(amounts: I) -> f64 {
    let cents: i64 = amounts.into_iter().map(to_cents).sum();
    cents as f64 / 100.0
}

// ---------------------------------------------------------------------------
// Flat grouping and filtering
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Group<T> {
    pub key: String,
    pub display_name: String,
    pub members: Vec<T>,
}

/// Group records by key, keeping groups in first-seen order. The display name
/// comes from the first member of each group.
pub fn group_by<T, K, N>(items: Vec<T>, key_of: K, name_of: N) -> Vec<Group<T>>
where
    K: Fn(&T) -> String,
    N: Fn(&T) -> String,
{
    let mut groups: Vec<Group<T>> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for item in items {
        let key = key_of(&item);
        match index.get(&key) {
            Some(&i) => groups[i].members.push(item),
            None => {
                index.insert(key.clone(), groups.len());
                groups.push(Group {
                    key,
                    display_name: name_of(&item),
                    members: vec![item],
                });
            }
        }
    }
    groups
}

pub fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

/// Keep items whose field contains `term`, ignoring case. An empty term keeps all.
pub fn filter_substring<T: Clone, F>(items: &[T], field: F, term: &str) -> Vec<T>
where
    F: Fn(&T) -> &str,
{
    let term = term.trim();
    if term.is_empty() {
        return items.to_vec();
    }
    items
        .iter()
        .filter(|item| contains_ci(field(item), term))
        .cloned()
        .collect()
}

/// Every whitespace-separated token of `query` must occur in `text`.
pub fn matches_all_tokens(text: &str, query: &str) -> bool {
    let lower = text.to_lowercase();
    query
        .to_lowercase()
        .split_whitespace()
        .all(|token| lower.contains(token))
}

// ---------------------------------------------------------------------------
// Search results
// ---------------------------------------------------------------------------

pub struct SearchSummary {
    pub rows: Vec<TaxpayerMatch>,
    pub total_debt: f64,
}

pub fn summarize_search(matches: &[TaxpayerMatch], entity_filter: &str) -> SearchSummary {
    let rows = filter_substring(matches, |m| m.entity_name.as_str(), entity_filter);
    let total_debt = sum_amounts(rows.iter().map(|m| m.outstanding_debt));
    SearchSummary { rows, total_debt }
}

pub fn group_by_entity(matches: Vec<TaxpayerMatch>) -> Vec<Group<TaxpayerMatch>> {
    group_by(
        matches,
        |m| m.entity_name.to_lowercase(),
        |m| m.entity_name.clone(),
    )
}

// ---------------------------------------------------------------------------
// Receipts
// ---------------------------------------------------------------------------

const PREVIEW_LIMIT: usize = 100;

#[derive(Debug, Clone, Default)]
pub struct ReceiptFilter {
    pub number: String,
    pub memo: String,
}

impl ReceiptFilter {
    fn accepts(&self, receipt: &Receipt) -> bool {
        let number = self.number.trim();
        if !number.is_empty() && !contains_ci(&receipt.number, number) {
            return false;
        }
        if !self.memo.trim().is_empty() {
            match receipt.memo.as_deref() {
                Some(memo) => matches_all_tokens(memo, &self.memo),
                None => false,
            }
        } else {
            true
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReceiptSummary {
    pub receipt: Receipt,
    pub total: f64,
    pub preview: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReceiptGroupSummary {
    pub id: Option<Ident>,
    pub series: String,
    pub issued_at: Option<String>,
    pub receipts: Vec<ReceiptSummary>,
    pub total: f64,
}

impl ReceiptGroupSummary {
    pub fn key(&self) -> String {
        self.id.as_ref().map(Ident::key).unwrap_or_default()
    }
}

fn memo_preview(receipt: &Receipt) -> String {
    let joined = receipt
        .line_items
        .iter()
        .map(|item| item.description.as_str())
        .collect::<Vec<_>>()
        .join(" | ");
    truncate(&joined, PREVIEW_LIMIT)
}

/// Filter receipts, derive totals from line items, and drop emptied groups.
/// Upstream `total` fields are ignored: they have disagreed with line sums.
pub fn aggregate_receipts(groups: Vec<ReceiptGroup>, filter: &ReceiptFilter) -> Vec<ReceiptGroupSummary> {
    groups
        .into_iter()
        .filter_map(|group| {
            let receipts: Vec<ReceiptSummary> = group
                .receipts
                .into_iter()
                .filter(|r| filter.accepts(r))
                .map(|receipt| ReceiptSummary {
                    total: sum_amounts(receipt.line_items.iter().map(|i| i.amount)),
                    preview: memo_preview(&receipt),
                    receipt,
                })
                .collect();
            if receipts.is_empty() {
                return None;
            }
            let total = sum_amounts(receipts.iter().map(|r| r.total));
            Some(ReceiptGroupSummary {
                id: group.ide_rcg,
                series: group.series,
                issued_at: group.issued_at,
                receipts,
                total,
            })
        })
        .collect()
}

pub fn receipts_grand_total(groups: &[ReceiptGroupSummary]) -> f64 {
    sum_amounts(groups.iter().map(|g| g.total))
}

// ---------------------------------------------------------------------------
// Declarations and vehicle tax
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DeclarationTotals {
    pub debt: f64,
    pub paid: f64,
    pub balance: f64,
}

/// Exact match on the fiscal year; an empty year keeps everything.
pub fn filter_declarations_by_year(rows: Vec<Declaration>, year: Option<&str>) -> Vec<Declaration> {
    match year.map(str::trim).filter(|y| !y.is_empty()) {
        Some(y) => rows.into_iter().filter(|d| d.year.trim() == y).collect(),
        None => rows,
    }
}

pub fn declaration_totals(rows: &[Declaration]) -> DeclarationTotals {
    DeclarationTotals {
        debt: sum_amounts(rows.iter().map(|d| d.total)),
        paid: sum_amounts(rows.iter().map(|d| d.paid)),
        balance: sum_amounts(rows.iter().map(|d| d.balance)),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct VehicleTotals {
    pub tax: f64,
    pub debt: f64,
    pub paid: f64,
    pub balance: f64,
}

pub fn vehicle_totals(rows: &[VehicleTax]) -> VehicleTotals {
    VehicleTotals {
        tax: sum_amounts(rows.iter().map(|v| v.tax)),
        debt: sum_amounts(rows.iter().map(|v| v.debt)),
        paid: sum_amounts(rows.iter().map(|v| v.paid)),
        balance: sum_amounts(rows.iter().map(|v| v.balance)),
    }
}

// ---------------------------------------------------------------------------
// User directory
// ---------------------------------------------------------------------------

const UNNAMED_ORGANIZATION: &str = "Unnamed entity";

pub fn group_users(users: Vec<ManagedUser>) -> Vec<Group<ManagedUser>> {
    group_by(
        users,
        |u| u.organization_id.as_ref().map(Ident::key).unwrap_or_default(),
        |u| {
            if u.name.trim().is_empty() {
                UNNAMED_ORGANIZATION.to_string()
            } else {
                u.name.clone()
            }
        },
    )
}

/// Status the user would get from a toggle. Admin accounts cannot be toggled.
pub fn next_status(users: &[ManagedUser], id: &Ident) -> Result<bool> {
    let user = users
        .iter()
        .find(|u| &u.id == id)
        .ok_or_else(|| ConsultaError::Validation(format!("no user with id {id}")))?;
    if user.is_admin {
        return Err(ConsultaError::Forbidden(format!(
            "{} is an administrator; administrator accounts cannot be deactivated",
            user.name
        )));
    }
    Ok(!user.active)
}

/// Record a confirmed status change on exactly one user.
pub fn apply_status(users: &mut [ManagedUser], id: &Ident, active: bool) {
    if let Some(user) = users.iter_mut().find(|u| &u.id == id) {
        user.active = active;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::decode;
    use serde_json::json;

    fn taxpayer(entity: &str, debt: f64) -> TaxpayerMatch {
        decode(json!({"nom_eje": entity, "imp_deu": debt, "nro_doc": "12345678"})).unwrap()
    }

    fn receipts_fixture() -> Vec<ReceiptGroup> {
        decode(json!([
            {
                "ide_rcg": 1, "ser_gru": "001", "total": 999.0,
                "recibos": [
                    {"ide_rec": 10, "nro_rec": "R-0010", "gls_rec": "Annual road tax notice", "total": 1.0,
                     "detalle": [{"des_itm": "Road", "val_tot": "10.10"}, {"des_itm": "Fee", "val_tot": 0.2}]},
                    {"ide_rec": 11, "nro_rec": "R-0011", "gls_rec": "Road notice",
                     "detalle": [{"des_itm": "Notice", "val_tot": 5}]}
                ]
            },
            {
                "IDE_RCG": 2, "SER_GRU": "002",
                "RECIBOS": [
                    {"IDE_REC": 20, "NRO_REC": "X-2000", "GLS_REC": null,
                     "DETALLE": [{"DES_ITM": "Arbitrios", "VAL_TOT": "-"}]}
                ]
            }
        ]))
        .unwrap()
    }

    #[test]
    fn cents_accumulation_is_exact() {
        assert_eq!(sum_amounts([0.1, 0.2]), 0.3);
        assert_eq!(sum_amounts([10.10, 0.2, f64::NAN]), 10.3);
        assert_eq!(sum_amounts(Vec::<f64>::new()), 0.0);
    }

    #[test]
    fn grouping_keeps_every_record_once_in_first_seen_order() {
        let rows = vec![
            taxpayer("MUNI B", 1.0),
            taxpayer("MUNI A", 2.0),
            taxpayer("muni b", 3.0),
            taxpayer("MUNI C", 4.0),
        ];
        let groups = group_by_entity(rows.clone());
        let keys: Vec<&str> = groups.iter().map(|g| g.key.as_str()).collect();
        assert_eq!(keys, vec!["muni b", "muni a", "muni c"]);
        assert_eq!(groups[0].display_name, "MUNI B");
        let total_members: usize = groups.iter().map(|g| g.members.len()).sum();
        assert_eq!(total_members, rows.len());
        for row in &rows {
            let hits = groups
                .iter()
                .flat_map(|g| g.members.iter())
                .filter(|m| *m == row)
                .count();
            assert_eq!(hits, 1);
        }
    }

    #[test]
    fn entity_filter_is_case_insensitive_and_idempotent() {
        let rows = vec![
            taxpayer("Municipalidad de Miraflores", 10.0),
            taxpayer("MUNICIPALIDAD DE SURCO", 20.0),
            taxpayer("Sat Lima", 30.0),
        ];
        let once = summarize_search(&rows, "MIRA");
        assert_eq!(once.rows.len(), 1);
        assert_eq!(once.total_debt, 10.0);
        let twice = summarize_search(&once.rows, "MIRA");
        assert_eq!(twice.rows, once.rows);
        let all = summarize_search(&rows, "  ");
        assert_eq!(all.rows.len(), 3);
        assert_eq!(all.total_debt, 60.0);
    }

    #[test]
    fn memo_tokens_use_and_semantics() {
        assert!(matches_all_tokens("annual road tax notice", "road tax"));
        assert!(!matches_all_tokens("road notice", "road tax"));
        assert!(matches_all_tokens("ROAD TAX", "  tax   road "));
        assert!(matches_all_tokens("anything", ""));
    }

    #[test]
    fn receipt_totals_are_derived_from_line_items() {
        let groups = aggregate_receipts(receipts_fixture(), &ReceiptFilter::default());
        assert_eq!(groups.len(), 2);
        let first = &groups[0];
        assert_eq!(first.receipts[0].total, 10.3);
        assert_eq!(first.receipts[1].total, 5.0);
        assert_eq!(first.total, 15.3);
        for g in &groups {
            let sum = sum_amounts(g.receipts.iter().map(|r| r.total));
            assert_eq!(g.total, sum);
            for r in &g.receipts {
                assert_eq!(r.total, sum_amounts(r.receipt.line_items.iter().map(|i| i.amount)));
            }
        }
        assert_eq!(groups[1].receipts[0].total, 0.0);
        assert_eq!(receipts_grand_total(&groups), 15.3);
    }

    #[test]
    fn receipt_filters_drop_empty_groups() {
        let memo = ReceiptFilter { number: String::new(), memo: "road tax".into() };
        let groups = aggregate_receipts(receipts_fixture(), &memo);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].receipts.len(), 1);
        assert_eq!(groups[0].receipts[0].receipt.number, "R-0010");
        assert_eq!(groups[0].total, 10.3);

        let number = ReceiptFilter { number: "x-2".into(), memo: String::new() };
        let groups = aggregate_receipts(receipts_fixture(), &number);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].key(), "2");
    }

    #[test]
    fn receipt_preview_is_truncated() {
        let long = "x".repeat(120);
        let groups: Vec<ReceiptGroup> = decode(json!([{
            "ide_rcg": 1,
            "recibos": [{"nro_rec": "1", "detalle": [{"des_itm": long, "val_tot": 1}]}]
        }]))
        .unwrap();
        let out = aggregate_receipts(groups, &ReceiptFilter::default());
        let preview = &out[0].receipts[0].preview;
        assert_eq!(preview.chars().count(), 103);
        assert!(preview.ends_with("..."));
    }

    #[test]
    fn declarations_filter_by_year_and_total() {
        let rows: Vec<Declaration> = decode(json!([
            {"ano_eje": 2024, "val_tot": "100.10", "imp_pag": 50, "imp_sld": "50.10"},
            {"ANO_EJE": "2025", "VAL_TOT": 200.0, "IMP_PAG": "-", "IMP_SLD": 200.0}
        ]))
        .unwrap();
        let only_2025 = filter_declarations_by_year(rows.clone(), Some("2025"));
        assert_eq!(only_2025.len(), 1);
        let totals = declaration_totals(&rows);
        assert_eq!(totals, DeclarationTotals { debt: 300.1, paid: 50.0, balance: 250.1 });
        assert_eq!(filter_declarations_by_year(rows, Some("")).len(), 2);
    }

    #[test]
    fn vehicle_totals_sum_each_column() {
        let rows: Vec<VehicleTax> = decode(json!([
            {"imp_imp": 10, "imp_deu": 8, "imp_pag": 2, "imp_sld": 6},
            {"imp_imp": "5.5", "imp_deu": null, "imp_pag": "1.5", "imp_sld": "x"}
        ]))
        .unwrap();
        assert_eq!(
            vehicle_totals(&rows),
            VehicleTotals { tax: 15.5, debt: 8.0, paid: 3.5, balance: 6.0 }
        );
    }

    fn users_fixture() -> Vec<ManagedUser> {
        decode(json!([
            {"id": 1, "nom_usu": "Notaria Uno", "flg_adm": 1, "act_ina": 1, "ide_not_sol_ser": 7},
            {"id": 2, "nom_usu": "Ana", "flg_adm": 0, "act_ina": 1, "ide_not_sol_ser": 7},
            {"id": 3, "nom_usu": "", "flg_adm": 0, "act_ina": 0, "ide_not_sol_ser": 8}
        ]))
        .unwrap()
    }

    #[test]
    fn users_group_by_organization() {
        let groups = group_users(users_fixture());
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].display_name, "Notaria Uno");
        assert_eq!(groups[0].members.len(), 2);
        assert_eq!(groups[1].display_name, "Unnamed entity");
    }

    #[test]
    fn toggling_flips_only_the_target_user() {
        let mut users = users_fixture();
        let before = users.clone();
        let target = Ident::new(2);
        let status = next_status(&users, &target).unwrap();
        assert!(!status);
        apply_status(&mut users, &target, status);
        for (old, new) in before.iter().zip(users.iter()) {
            if old.id == target {
                assert_eq!(new.active, !old.active);
            } else {
                assert_eq!(new, old);
            }
        }
    }

    #[test]
    fn toggling_an_admin_is_rejected() {
        let users = users_fixture();
        let err = next_status(&users, &Ident::new(1)).unwrap_err();
        assert!(matches!(err, ConsultaError::Forbidden(_)));
        assert!(next_status(&users, &Ident::new(99)).is_err());
    }
}
