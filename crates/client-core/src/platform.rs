/// Platform introspection the worker loop needs at startup: whether it is running inside a
/// container, and whether a container runtime is reachable. Injected as a capability so tests
/// can supply a stub instead of patching global process state.
pub trait Platform: Send + Sync {
    fn in_docker(&self) -> bool;
    fn container_runtime_available(&self) -> bool;
}

/// Real platform introspection: reads `/proc/self/cgroup` and probes the configured
/// container-runtime CLI.
#[derive(Debug, Clone)]
pub struct HostPlatform {
    runtime_cli: String,
}

impl HostPlatform {
    pub fn new(runtime_cli: impl Into<String>) -> Self {
        Self {
            runtime_cli: runtime_cli.into(),
        }
    }
}

impl Platform for HostPlatform {
    fn in_docker(&self) -> bool {
        std::fs::read_to_string("/proc/self/cgroup")
            .map(|contents| contents.contains("docker"))
            .unwrap_or(false)
    }

    fn container_runtime_available(&self) -> bool {
        std::process::Command::new(&self.runtime_cli)
            .arg("info")
            .output()
            .map(|out| out.status.success())
            .unwrap_or(false)
    }
}

/// Test stub with fixed answers.
#[derive(Debug, Clone, Copy, Default)]
pub struct FakePlatform {
    pub in_docker: bool,
    pub runtime_available: bool,
}

impl Platform for FakePlatform {
    fn in_docker(&self) -> bool {
        self.in_docker
    }

    fn container_runtime_available(&self) -> bool {
        self.runtime_available
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_platform_reports_fixed_values() {
        let platform = FakePlatform {
            in_docker: true,
            runtime_available: false,
        };
        assert!(platform.in_docker());
        assert!(!platform.container_runtime_available());
    }
}
