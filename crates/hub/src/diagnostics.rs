//! Host health for the diagnostics page.

use serde::Serialize;
use sysinfo::{Components, System};

#[derive(Debug, Serialize)]
pub struct HostDiagnostics {
    pub host_name: Option<String>,
    pub os: Option<String>,
    pub kernel: Option<String>,
    pub uptime_secs: u64,
    pub load_average: [f64; 3],
    pub memory_total_bytes: u64,
    pub memory_used_bytes: u64,
    pub components: Vec<ComponentTemperature>,
}

/// SoC or board sensor reported by the kernel.
#[derive(Debug, Serialize)]
pub struct ComponentTemperature {
    pub label: String,
    pub temperature: f32,
}

impl HostDiagnostics {
    /// Takes a fresh reading on every call; intended for on-demand requests.
    pub fn collect() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        let load = System::load_average();

        let components = Components::new_with_refreshed_list()
            .list()
            .iter()
            .map(|c| ComponentTemperature {
                label: c.label().to_string(),
                temperature: c.temperature(),
            })
            .collect();

        Self {
            host_name: System::host_name(),
            os: System::long_os_version(),
            kernel: System::kernel_version(),
            uptime_secs: System::uptime(),
            load_average: [load.one, load.five, load.fifteen],
            memory_total_bytes: system.total_memory(),
            memory_used_bytes: system.used_memory(),
            components,
        }
    }
}
