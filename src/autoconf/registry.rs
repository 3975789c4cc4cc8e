//! Accumulation of partial service knowledge during full
//! autoconfiguration.
//!
//! The SDT (or ATSC VCT) names services; the PAT maps them onto PMT pids.
//! Either table may arrive first, so the registry upserts from both sides
//! and reports completeness once every PAT-listed service has both halves.

use std::collections::BTreeMap;

/// A service as known so far.
#[derive(Debug, Clone)]
pub struct Service {
    /// Service id (program number).
    pub service_id: u16,
    /// Service name; `"???"` until the SDT/PSIP names it.
    pub name: String,
    /// Service type (EN 300 468 table 81), 0 until known.
    pub service_type: u8,
    /// free_CA_mode: set when the service is scrambled.
    pub free_ca: bool,
    /// PMT pid from the PAT.
    pub pmt_pid: Option<u16>,
    /// running_status from the SDT.
    pub running_status: u8,
    named: bool,
}

impl Service {
    fn unnamed(service_id: u16) -> Self {
        Self {
            service_id,
            name: "???".to_string(),
            service_type: 0,
            free_ca: false,
            pmt_pid: None,
            running_status: 0,
            named: false,
        }
    }

    /// True once the SDT or PSIP side has been seen.
    pub fn named(&self) -> bool {
        self.named
    }
}

/// Map of discovered services keyed by service id.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    services: BTreeMap<u16, Service>,
}

impl ServiceRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records what an SDT (or VCT) says about a service. Never touches
    /// the pmt_pid.
    pub fn upsert_from_sdt(
        &mut self,
        service_id: u16,
        name: &str,
        service_type: u8,
        free_ca: bool,
        running_status: u8,
    ) {
        let service = self
            .services
            .entry(service_id)
            .or_insert_with(|| Service::unnamed(service_id));
        service.name = name.to_string();
        service.service_type = service_type;
        service.free_ca = free_ca;
        service.running_status = running_status;
        service.named = true;
    }

    /// Records a `(program_number, pmt_pid)` pair from the PAT. An
    /// existing pmt_pid is kept.
    pub fn upsert_from_pat(&mut self, service_id: u16, pmt_pid: u16) {
        let service = self
            .services
            .entry(service_id)
            .or_insert_with(|| Service::unnamed(service_id));
        if service.pmt_pid.is_none() {
            service.pmt_pid = Some(pmt_pid);
        }
    }

    /// True when both sides of a service are known.
    pub fn is_complete(&self, service_id: u16) -> bool {
        self.services
            .get(&service_id)
            .map(|s| s.named && s.pmt_pid.is_some())
            .unwrap_or(false)
    }

    /// True when every service the PAT announced is complete. An empty
    /// announcement is trivially complete.
    pub fn all_complete(&self, announced: &[u16]) -> bool {
        announced.iter().all(|&id| self.is_complete(id))
    }

    /// Number of services seen so far.
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// True when no service has been seen.
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Looks up a service.
    pub fn get(&self, service_id: u16) -> Option<&Service> {
        self.services.get(&service_id)
    }

    /// Moves the services out, ordered by ascending service id.
    pub fn take_sorted(&mut self) -> Vec<Service> {
        std::mem::take(&mut self.services).into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_both_sides() {
        let mut registry = ServiceRegistry::new();
        registry.upsert_from_pat(100, 256);
        assert!(!registry.is_complete(100));
        assert_eq!(registry.get(100).unwrap().name, "???");

        registry.upsert_from_sdt(100, "A", 0x01, false, 4);
        assert!(registry.is_complete(100));
        assert_eq!(registry.get(100).unwrap().pmt_pid, Some(256));
        assert_eq!(registry.get(100).unwrap().name, "A");
    }

    #[test]
    fn test_sdt_never_clears_pmt_pid() {
        let mut registry = ServiceRegistry::new();
        registry.upsert_from_pat(100, 256);
        registry.upsert_from_sdt(100, "A", 0x01, false, 4);
        registry.upsert_from_pat(100, 999);
        assert_eq!(registry.get(100).unwrap().pmt_pid, Some(256));
    }

    #[test]
    fn test_all_complete() {
        let mut registry = ServiceRegistry::new();
        registry.upsert_from_sdt(100, "A", 0x01, false, 4);
        registry.upsert_from_sdt(200, "B", 0x01, false, 4);
        registry.upsert_from_pat(100, 256);
        assert!(!registry.all_complete(&[100, 200]));
        registry.upsert_from_pat(200, 512);
        assert!(registry.all_complete(&[100, 200]));
        assert!(registry.all_complete(&[]));
    }

    #[test]
    fn test_take_sorted_orders_by_id() {
        let mut registry = ServiceRegistry::new();
        for id in [300u16, 100, 200] {
            registry.upsert_from_pat(id, id + 1);
        }
        let sorted = registry.take_sorted();
        let ids: Vec<u16> = sorted.iter().map(|s| s.service_id).collect();
        assert_eq!(ids, vec![100, 200, 300]);
        assert!(registry.is_empty());
    }
}
