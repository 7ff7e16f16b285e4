//! Safe wrappers over interface lookups.

use std::io;

/// Returns the index of the network interface called `name`.
pub fn if_nametoindex(name: &str) -> io::Result<i32> {
    let index = nix::net::if_::if_nametoindex(name).map_err(io::Error::from)?;
    i32::try_from(index).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidData, format!("interface index {index} out of range"))
    })
}
