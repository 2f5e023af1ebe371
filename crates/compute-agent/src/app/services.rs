use std::sync::Arc;

use crate::domain::pci::PciPassthroughRegistry;
use crate::domain::reporter::CapabilityReporter;
use crate::domain::ComputeHost;

/// Long-lived components shared by the application tasks.
#[derive(Clone)]
pub struct ApplicationServices {
    pub host: Arc<ComputeHost>,
    pub reporter: Arc<CapabilityReporter>,
    pub pci: Arc<PciPassthroughRegistry>,
}
