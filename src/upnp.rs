//! UPnP port-mapping seam (spec §1 "keep the public port-mapping
//! contract"; SPEC_FULL.md §9-note). The source's SSDP discovery plus
//! SOAP `AddPortMapping`/`DeletePortMapping` calls are out of core scope;
//! [`PortMapper`] is the trait standing in for that contract, with
//! [`NullPortMapper`] as the default implementation (no SSDP, no SOAP),
//! mirroring how [`crate::discovery::directory::DirectoryClient`] ships
//! only a trait plus an in-memory double for the same reason.

use async_trait::async_trait;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Udp,
    Tcp,
}

impl Protocol {
    fn as_str(self) -> &'static str {
        match self {
            Self::Udp => "UDP",
            Self::Tcp => "TCP",
        }
    }
}

/// `(external port, internal port, protocol)` / `(external port,
/// protocol)` mapping contract (spec §9 "public contract
/// `add_port_mapping(ext, int, proto)`, `delete_port_mapping(ext,
/// proto)`").
#[async_trait]
pub trait PortMapper: Send + Sync {
    async fn add_port_mapping(&self, external_port: u16, internal_port: u16, protocol: Protocol) -> anyhow::Result<()>;
    async fn delete_port_mapping(&self, external_port: u16, protocol: Protocol) -> anyhow::Result<()>;
}

/// Default implementation: neither SSDP gateway discovery nor the SOAP
/// `AddPortMapping`/`DeletePortMapping` actions are implemented (spec
/// §9 "a real implementation is required for parity"), so every call
/// fails. Kept as the `features.upnp` default so enabling the feature
/// without a real `PortMapper` surfaces a clear error instead of
/// silently doing nothing.
pub struct NullPortMapper;

#[async_trait]
impl PortMapper for NullPortMapper {
    async fn add_port_mapping(&self, external_port: u16, _internal_port: u16, protocol: Protocol) -> anyhow::Result<()> {
        Err(anyhow::anyhow!(
            "UPnP add_port_mapping({external_port}, {}) not implemented: no SSDP/SOAP backend configured",
            protocol.as_str()
        ))
    }

    async fn delete_port_mapping(&self, external_port: u16, protocol: Protocol) -> anyhow::Result<()> {
        Err(anyhow::anyhow!(
            "UPnP delete_port_mapping({external_port}, {}) not implemented: no SSDP/SOAP backend configured",
            protocol.as_str()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_port_mapper_rejects_add() {
        let mapper = NullPortMapper;
        assert!(mapper.add_port_mapping(8000, 8000, Protocol::Udp).await.is_err());
    }

    #[tokio::test]
    async fn null_port_mapper_rejects_delete() {
        let mapper = NullPortMapper;
        assert!(mapper.delete_port_mapping(8000, Protocol::Udp).await.is_err());
    }
}
