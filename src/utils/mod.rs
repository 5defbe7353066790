pub mod time;

use crate::{FleetError, Result};

/// Short unique id used for package and script file names.
pub fn longid() -> String {
    nanoid::nanoid!(12)
}

/// Splits an `ip:port` layout entry on its last `:`.
pub fn split_host_port(addr: &str) -> Result<(String, u16)> {
    let (host, port) = addr.trim().rsplit_once(':').ok_or_else(|| FleetError::Config(format!("expected ip:port, got '{}'", addr)))?;
    if host.is_empty() {
        return Err(FleetError::Config(format!("missing host in '{}'", addr)));
    }
    let port = port.parse::<u16>().map_err(|err| FleetError::Config(format!("invalid port in '{}': {}", addr, err)))?;
    Ok((host.to_string(), port))
}
