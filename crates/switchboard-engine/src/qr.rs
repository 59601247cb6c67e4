/// Turns a raw QR payload into whatever representation clients display.
pub trait QrRenderer: Send + Sync {
    fn render(&self, payload: &str) -> Result<String, QrError>;
}

#[derive(Debug, thiserror::Error)]
#[error("qr render failed: {0}")]
pub struct QrError(pub String);

/// Passes the payload through unchanged; clients render it themselves.
#[derive(Clone, Copy, Debug, Default)]
pub struct RawQr;

impl QrRenderer for RawQr {
    fn render(&self, payload: &str) -> Result<String, QrError> {
        if payload.is_empty() {
            return Err(QrError("empty payload".into()));
        }
        Ok(payload.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_passthrough() {
        assert_eq!(RawQr.render("2@abc,def").unwrap(), "2@abc,def");
        assert!(RawQr.render("").is_err());
    }
}
