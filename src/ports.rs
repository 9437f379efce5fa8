//! TCP port allocation for worker listeners.

use std::net::{Ipv4Addr, TcpListener};

use tracing::debug;

use crate::types::CoreError;

/// Find an unused TCP port at or above `base_port`.
///
/// Probes monotonically upward by attempting a loopback bind and returns the
/// first port that binds; the probe socket is closed before returning, so no
/// reservation is made. Callers must treat a bind failure at actual launch
/// time as retryable, since another process can grab the port in between.
pub fn find_available(base_port: u16) -> Result<u16, CoreError> {
    for port in base_port..=u16::MAX {
        match TcpListener::bind((Ipv4Addr::LOCALHOST, port)) {
            Ok(listener) => {
                drop(listener);
                if port != base_port {
                    debug!(base_port, port, "Base port occupied, settled on a higher one");
                }
                return Ok(port);
            }
            Err(_) => continue,
        }
    }
    Err(CoreError::Platform {
        reason: format!("no free TCP port at or above {base_port}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_at_or_above_base_and_bindable() {
        let port = find_available(20_000).unwrap();
        assert!(port >= 20_000);
        // Still bindable immediately afterwards: the probe released it.
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port)).unwrap();
        drop(listener);
    }

    #[test]
    fn skips_an_occupied_base_port() {
        let held = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let base = held.local_addr().unwrap().port();
        let port = find_available(base).unwrap();
        assert!(port > base);
    }
}
