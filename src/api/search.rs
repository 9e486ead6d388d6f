use regex::Regex;
use serde_json::json;

use super::ApiClient;
use crate::error::{ConsultaError, Result};
use crate::models::TaxpayerMatch;
use crate::normalize::{decode, search_rows};

/// DNI is 8 digits, RUC 11; anything in between is accepted like the web form did.
pub fn validate_document_number(raw: &str) -> Result<String> {
    let doc = raw.trim();
    let digits = Regex::new(r"^[0-9]*$").map_err(|e| ConsultaError::Other(e.to_string()))?;
    if !digits.is_match(doc) {
        return Err(ConsultaError::Validation(
            "The document number may only contain digits.".to_string(),
        ));
    }
    if doc.len() < 8 {
        return Err(ConsultaError::Validation(
            "The document number must have at least 8 digits.".to_string(),
        ));
    }
    if doc.len() > 11 {
        return Err(ConsultaError::Validation(
            "The document number can have at most 11 digits.".to_string(),
        ));
    }
    Ok(doc.to_string())
}

impl ApiClient {
    /// Taxpayer matches across all connected entities. An empty vector is the
    /// "no information" outcome, not an error.
    pub fn search_by_document(&self, document_number: &str) -> Result<Vec<TaxpayerMatch>> {
        let doc = validate_document_number(document_number)?;
        let value = self.post_json(
            "/api/search/doc",
            &json!({ "documentNumber": doc }),
            "Taxpayer search failed",
        )?;
        search_rows(value).into_iter().map(decode).collect()
    }
}
