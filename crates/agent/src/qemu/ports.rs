//! Host port selection for the user-mode SSH forward.

use skiff_common::Result;
use std::net::TcpListener;

/// Pick an ephemeral localhost TCP port: bind port 0, read the assigned
/// port, release the socket. The kernel keeps recently released ports out of
/// rotation long enough for QEMU to claim it.
pub fn pick_free_port() -> Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn picked_port_is_nonzero_and_bindable() {
        let port = pick_free_port().unwrap();
        assert!(port > 0);
        // Nothing holds it; we can take it ourselves.
        TcpListener::bind(("127.0.0.1", port)).unwrap();
    }

    #[test]
    fn contended_port_is_not_picked_again() {
        let first = pick_free_port().unwrap();
        let _holder = TcpListener::bind(("127.0.0.1", first)).unwrap();
        let second = pick_free_port().unwrap();
        assert_ne!(first, second);
    }
}
