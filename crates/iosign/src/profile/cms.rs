//! CMS envelope of `.mobileprovision` files.
//!
//! A provisioning profile is a DER `ContentInfo` of type SignedData whose
//! encapsulated content is an XML plist. The signer signature is verified
//! against the embedded content, but the signer chain is not checked against
//! Apple's roots, which build machines rarely have installed.

use openssl::cms::{CMSOptions, CmsContentInfo};

/// Verify the envelope and return the embedded plist bytes.
pub fn open_envelope(der: &[u8]) -> std::result::Result<Vec<u8>, String> {
    if der.is_empty() {
        return Err("empty input".into());
    }
    let mut envelope = CmsContentInfo::from_der(der)
        .map_err(|e| format!("not a CMS ContentInfo: {}", e))?;

    let mut content = Vec::new();
    envelope
        .verify(
            None,
            None,
            None,
            Some(&mut content),
            CMSOptions::NO_SIGNER_CERT_VERIFY,
        )
        .map_err(|e| format!("CMS signature did not verify: {}", e))?;

    if content.is_empty() {
        return Err("CMS envelope carries no content".into());
    }
    Ok(content)
}
