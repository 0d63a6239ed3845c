use std::sync::OnceLock;

/// rustls 0.23 requires a process-level CryptoProvider selection.
///
/// When several dependencies enable both rustls providers (`ring` and `aws-lc-rs`), rustls
/// cannot infer a default and panics on the first TLS config build. Installing `ring`
/// explicitly avoids that; an already-installed provider is left in place.
pub fn install_rustls_crypto_provider() {
    static INSTALLED: OnceLock<()> = OnceLock::new();
    INSTALLED.get_or_init(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}
