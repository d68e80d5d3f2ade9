//! SIP URI builder for the PBX
//!
//! Centralizes URI generation so the domain and application host come from
//! configuration instead of being spelled out at every call site.

use pbx_registrar_core::TransportKind;

use crate::config::GeneralConfig;
use crate::entities::Trunk;

/// SIP URI builder that uses configuration to generate URIs
pub struct SipUriBuilder<'a> {
    config: &'a GeneralConfig,
}

impl<'a> SipUriBuilder<'a> {
    pub fn new(config: &'a GeneralConfig) -> Self {
        Self { config }
    }

    /// Address-of-record of an extension
    pub fn extension_uri(&self, number: &str) -> String {
        format!("sip:{}@{}", number, self.config.domain)
    }

    /// Registered contact when there is one, otherwise the address-of-record
    pub fn extension_uri_with_fallback(&self, number: &str, contact: Option<&str>) -> String {
        contact
            .map(|uri| uri.to_string())
            .unwrap_or_else(|| self.extension_uri(number))
    }

    /// Number dialed out through a trunk
    pub fn trunk_uri(&self, number: &str, trunk: &Trunk) -> String {
        let mut uri = format!("sip:{}@{}:{}", number, trunk.host, trunk.port);
        if trunk.transport != TransportKind::Udp {
            uri.push_str(";transport=");
            uri.push_str(trunk.transport.as_str());
        }
        uri
    }

    /// Voicemail box on the media application server
    pub fn voicemail_uri(&self, box_id: &str) -> String {
        format!("sip:voicemail-{}@{}", box_id, self.config.app_host)
    }

    /// IVR menu on the media application server
    pub fn ivr_uri(&self, menu_id: &str) -> String {
        format!("sip:ivr-{}@{}", menu_id, self.config.app_host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uri_builder_basic() {
        let config = GeneralConfig {
            domain: "acme.example".to_string(),
            app_host: "10.0.0.5".to_string(),
            ..Default::default()
        };
        let builder = SipUriBuilder::new(&config);

        assert_eq!(builder.extension_uri("100"), "sip:100@acme.example");
        assert_eq!(builder.voicemail_uri("vm1"), "sip:voicemail-vm1@10.0.0.5");
        assert_eq!(builder.ivr_uri("main"), "sip:ivr-main@10.0.0.5");
    }

    #[test]
    fn test_trunk_uri_transport_param() {
        let config = GeneralConfig::default();
        let builder = SipUriBuilder::new(&config);
        let mut trunk = Trunk::new("t1", "sip.carrier.example");

        assert_eq!(
            builder.trunk_uri("0049891234567", &trunk),
            "sip:0049891234567@sip.carrier.example:5060"
        );
        trunk.transport = TransportKind::Tls;
        trunk.port = 5061;
        assert_eq!(
            builder.trunk_uri("0049891234567", &trunk),
            "sip:0049891234567@sip.carrier.example:5061;transport=tls"
        );
    }

    #[test]
    fn test_uri_builder_with_fallback() {
        let config = GeneralConfig::default();
        let builder = SipUriBuilder::new(&config);

        assert_eq!(
            builder.extension_uri_with_fallback("100", Some("sip:100@192.168.1.20:5062")),
            "sip:100@192.168.1.20:5062"
        );
        assert_eq!(builder.extension_uri_with_fallback("100", None), "sip:100@pbx.local");
    }
}
