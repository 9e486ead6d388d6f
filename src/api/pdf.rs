use serde_json::{json, Value};

use super::ApiClient;
use crate::error::{ConsultaError, Result};
use crate::models::SignatureResponse;
use crate::normalize::decode;

impl ApiClient {
    /// Digital-signature metadata of a signed PDF, if the service finds any.
    pub fn extract_signature(&self, pdf_url: &str) -> Result<Option<Value>> {
        let value = self.post_json(
            "/api/pdf/extract-signature",
            &json!({ "pdfUrl": pdf_url }),
            "Could not read the document signature",
        )?;
        let resp: SignatureResponse = decode(value)?;
        Ok(resp.signature.filter(|s| !s.is_null()))
    }

    /// Convert a base64 ZIP archive holding a PDF into the PDF bytes.
    pub fn archive_to_pdf(&self, base64_data: &str) -> Result<Vec<u8>> {
        let bytes = self.post_bytes(
            "/api/pdf/zip-to-pdf",
            &json!({ "base64Data": base64_data }),
            "Could not extract the document",
        )?;
        if !bytes.starts_with(b"%PDF") {
            return Err(ConsultaError::Other(
                "the extracted document is not a PDF".to_string(),
            ));
        }
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::client::testing::{serve_json, serve_once};

    #[test]
    fn signature_metadata_is_returned() {
        let (settings, server) = serve_json("200 OK", r#"{"signature": {"signer": "JUAN PEREZ"}}"#);
        let client = ApiClient::new(&settings, Some("t".into())).unwrap();
        let sig = client.extract_signature("https://qr/doc?id=1&token=t").unwrap();
        assert_eq!(sig, Some(json!({"signer": "JUAN PEREZ"})));
        assert_eq!(
            server.join().unwrap().json(),
            json!({"pdfUrl": "https://qr/doc?id=1&token=t"})
        );
    }

    #[test]
    fn missing_signature_is_none() {
        let (settings, server) = serve_json("200 OK", r#"{"signature": null}"#);
        let client = ApiClient::new(&settings, Some("t".into())).unwrap();
        assert_eq!(client.extract_signature("u").unwrap(), None);
        server.join().unwrap();
    }

    #[test]
    fn archive_conversion_returns_pdf_bytes() {
        let (settings, server) = serve_once("200 OK", "application/pdf", b"%PDF-1.4 body".to_vec());
        let client = ApiClient::new(&settings, Some("t".into())).unwrap();
        let bytes = client.archive_to_pdf("UEsDBA==").unwrap();
        assert!(bytes.starts_with(b"%PDF-1.4"));
        assert_eq!(server.join().unwrap().json(), json!({"base64Data": "UEsDBA=="}));
    }

    #[test]
    fn server_error_on_conversion() {
        let (settings, server) = serve_once("500 Internal Server Error", "text/plain", b"boom".to_vec());
        let client = ApiClient::new(&settings, Some("t".into())).unwrap();
        let err = client.archive_to_pdf("x").unwrap_err();
        server.join().unwrap();
        assert_eq!(err.to_string(), "Internal Server Error");
    }
}
