//! Netlink address wrapper and ancillary-credential parsing.

use std::mem;

use crate::{Error, Result};

/// A netlink socket address (`sockaddr_nl`), trimmed to what a [`crate::Monitor`] needs: its own
/// port-id, and the multicast group bitmask it is bound to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NetlinkAddr(libc::sockaddr_nl);

impl NetlinkAddr {
    /// Builds an unbound address for the given multicast group bitmask.
    ///
    /// SAFETY: `sockaddr_nl` is a plain-old-data struct; zeroing it yields a valid value with
    /// `nl_family` not yet set, which is filled in immediately after.
    pub fn new(groups: u32) -> Self {
        let mut nl = unsafe { mem::zeroed::<libc::sockaddr_nl>() };
        nl.nl_family = libc::AF_NETLINK as u16;
        nl.nl_groups = groups;
        Self(nl)
    }

    /// Reads back the address the kernel assigned a bound socket.
    pub fn from_getsockname(fd: i32) -> Result<Self> {
        let mut nl = unsafe { mem::zeroed::<libc::sockaddr_nl>() };
        let mut len = mem::size_of::<libc::sockaddr_nl>() as u32;

        // SAFETY: `fd` is a valid, open socket; `nl`/`len` are valid, appropriately-sized
        // out-parameters for `getsockname`.
        let ret = unsafe {
            libc::getsockname(fd, &mut nl as *mut libc::sockaddr_nl as *mut _, &mut len)
        };

        if ret < 0 {
            Err(Error::from(std::io::Error::last_os_error()))
        } else {
            Ok(Self(nl))
        }
    }

    /// The kernel-assigned port-id (usually, but not necessarily, the owning process's PID).
    pub const fn port_id(&self) -> u32 {
        self.0.nl_pid
    }

    /// The multicast group bitmask this address is bound to.
    pub const fn groups(&self) -> u32 {
        self.0.nl_groups
    }

    /// Sets the multicast group bitmask.
    pub fn set_groups(&mut self, groups: u32) {
        self.0.nl_groups = groups;
    }

    /// Sets the destination port-id, for addresses used as a unicast send target.
    pub fn set_port_id(&mut self, pid: u32) {
        self.0.nl_pid = pid;
    }

    /// Gets a raw pointer to the underlying `sockaddr_nl`, for `bind`/`sendmsg`/`recvmsg`.
    pub fn as_ptr(&self) -> *const libc::sockaddr_nl {
        &self.0 as *const _
    }

    /// Gets a mutable raw pointer to the underlying `sockaddr_nl`, for `recvmsg`'s `msg_name`.
    pub fn as_mut_ptr(&mut self) -> *mut libc::sockaddr_nl {
        &mut self.0 as *mut _
    }
}

/// Extracts sender credentials (`SCM_CREDENTIALS`) from a `recvmsg` ancillary-data buffer.
///
/// Accepts either a buffer prefixed with a `cmsghdr` (the normal case) or a bare `ucred` (some
/// kernels/paths may deliver it unwrapped); anything shorter than a `ucred` is rejected.
pub fn parse_cmsg(msg_control: &[u8]) -> Result<libc::ucred> {
    let controllen = msg_control.len();
    let header_len = mem::size_of::<libc::cmsghdr>();
    let ucred_len = mem::size_of::<libc::ucred>();
    let int_len = mem::size_of::<libc::c_int>();

    let read_ucred = |buf: &[u8]| -> Result<libc::ucred> {
        let pid = libc::pid_t::from_ne_bytes(buf[0..int_len].try_into()?);
        let uid = libc::uid_t::from_ne_bytes(buf[int_len..2 * int_len].try_into()?);
        let gid = libc::gid_t::from_ne_bytes(buf[2 * int_len..3 * int_len].try_into()?);
        Ok(libc::ucred { pid, uid, gid })
    };

    if controllen >= header_len + ucred_len {
        let cmsg_type_off = int_len * 3;
        let cmsg_type = libc::c_int::from_ne_bytes(
            msg_control[cmsg_type_off..cmsg_type_off + int_len].try_into()?,
        );

        if cmsg_type != libc::SCM_CREDENTIALS {
            Err(Error::Again(
                "no sender credentials received, message ignored".into(),
            ))
        } else {
            read_ucred(&msg_control[header_len..])
        }
    } else if controllen >= ucred_len {
        read_ucred(msg_control)
    } else {
        Err(Error::Again(format!(
            "msg_controllen ({controllen}) is too small for credentials"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_netlink_addr_new() {
        let addr = NetlinkAddr::new(2);
        assert_eq!(addr.groups(), 2);
        assert_eq!(addr.port_id(), 0);
    }

    #[test]
    fn test_netlink_addr_set_port_id_and_groups() {
        let mut addr = NetlinkAddr::new(0);
        addr.set_port_id(1234);
        addr.set_groups(1);
        assert_eq!(addr.port_id(), 1234);
        assert_eq!(addr.groups(), 1);
    }

    #[test]
    fn test_parse_cmsg_rejects_short_buffer() {
        let buf = [0u8; 4];
        assert!(parse_cmsg(&buf).is_err());
    }

    #[test]
    fn test_parse_cmsg_bare_ucred() {
        let ucred = libc::ucred {
            pid: 42,
            uid: 0,
            gid: 0,
        };
        let mut buf = Vec::new();
        buf.extend_from_slice(&ucred.pid.to_ne_bytes());
        buf.extend_from_slice(&ucred.uid.to_ne_bytes());
        buf.extend_from_slice(&ucred.gid.to_ne_bytes());

        let parsed = parse_cmsg(&buf).unwrap();
        assert_eq!(parsed.pid, 42);
        assert_eq!(parsed.uid, 0);
    }

    #[test]
    fn test_parse_cmsg_with_cmsghdr_wrong_type_rejected() {
        let header_len = mem::size_of::<libc::cmsghdr>();
        let mut buf = vec![0u8; header_len + mem::size_of::<libc::ucred>()];
        let int_len = mem::size_of::<libc::c_int>();
        let cmsg_type_off = int_len * 3;
        buf[cmsg_type_off..cmsg_type_off + int_len]
            .copy_from_slice(&(libc::SCM_RIGHTS).to_ne_bytes());

        assert!(parse_cmsg(&buf).is_err());
    }
}
