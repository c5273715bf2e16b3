//! Connects to a device event source: the kernel's uevent multicast group, or a peer device
//! manager's rebroadcast group.

use std::marker::PhantomData;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::{io, mem};

use crate::context::{Context, FsLivenessProbe, LivenessProbe};
use crate::device::Device;
use crate::error::{Error, Result};
use crate::filter::{self, SubsystemFilter, TagFilter};
use crate::hash::{bloom64, hash32};
use crate::header::{Group, NetlinkHeader};
use crate::log::LogPriority;
use crate::socket::{parse_cmsg, NetlinkAddr};

/// Size of the fixed receive buffer, matching the peer implementation's datagram budget.
const RECV_BUF_LEN: usize = 8192;

/// Upper bound on receive-loop iterations per public `receive_device` call, guarding against a
/// misbehaving sender that floods datagrams none of which ever pass the filter.
const MAX_RECEIVE_ATTEMPTS: usize = 1024;

struct MonitorInner {
    ctx: Context,
    fd: RawFd,
    group: Group,
    local_addr: NetlinkAddr,
    trusted_sender: Option<u32>,
    default_destination: NetlinkAddr,
    subsystem_filter: SubsystemFilter,
    tag_filter: TagFilter,
    bound: bool,
}

impl MonitorInner {
    fn filter_update(&mut self) -> Result<()> {
        if self.subsystem_filter.is_empty() && self.tag_filter.is_empty() {
            return Ok(());
        }

        let mut program = filter::compile(&self.subsystem_filter, &self.tag_filter)?;
        let mut fprog = program.as_sock_fprog();

        // SAFETY: `fd` is a valid, open socket; `fprog` borrows `program`, which outlives this
        // call, and `setsockopt` copies the instructions into the kernel before returning.
        let ret = unsafe {
            libc::setsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_ATTACH_FILTER,
                &mut fprog as *mut libc::sock_fprog as *mut _,
                mem::size_of::<libc::sock_fprog>() as u32,
            )
        };

        if ret < 0 {
            Err(Error::from(io::Error::last_os_error()))
        } else {
            Ok(())
        }
    }

    fn has_queued_datagram(&self) -> Result<bool> {
        let mut pfd = [libc::pollfd {
            fd: self.fd,
            events: libc::POLLIN,
            revents: 0,
        }];

        // SAFETY: `pfd` is a single, properly initialized `pollfd` entry.
        let ret = unsafe { libc::poll(pfd.as_mut_ptr(), 1, 0) };
        if ret < 0 {
            Err(Error::from(io::Error::last_os_error()))
        } else {
            Ok(ret > 0)
        }
    }
}

impl Drop for MonitorInner {
    fn drop(&mut self) {
        if self.fd >= 0 {
            // SAFETY: `fd` is either a valid, open descriptor owned exclusively by this monitor,
            // or already closed and left negative by `disconnect`.
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}

/// A shared handle to a device-event monitor.
///
/// Cloning a [Monitor] yields another owner of the same underlying socket and filter state (via
/// `Arc<Mutex<_>>`); the socket is closed when the last clone drops. Generic over the [`Device`]
/// implementation the receive/send paths construct and serialize.
pub struct Monitor<D>(Arc<Mutex<MonitorInner>>, PhantomData<fn() -> D>);

impl<D> Clone for Monitor<D> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0), PhantomData)
    }
}

/// A non-owning reference to a [Monitor]. `upgrade` returns `None` once every [Monitor] handle
/// has dropped and the socket has been closed.
pub struct WeakMonitor<D>(Weak<Mutex<MonitorInner>>, PhantomData<fn() -> D>);

impl<D> Clone for WeakMonitor<D> {
    fn clone(&self) -> Self {
        Self(self.0.clone(), PhantomData)
    }
}

impl<D> WeakMonitor<D> {
    /// Attempts to recover a strong [Monitor] handle.
    pub fn upgrade(&self) -> Option<Monitor<D>> {
        self.0.upgrade().map(|inner| Monitor(inner, PhantomData))
    }
}

impl<D: Device> Monitor<D> {
    fn lock(&self) -> MutexGuard<'_, MonitorInner> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn from_inner(inner: MonitorInner) -> Self {
        Self(Arc::new(Mutex::new(inner)), PhantomData)
    }

    /// Creates a monitor bound to the given group (`none`/`kernel`/`peer`), with a freshly opened
    /// netlink socket. Uses the default, filesystem-backed [LivenessProbe] to decide whether a
    /// requested `peer` group should be silently downgraded to `none`.
    pub fn from_group(ctx: Context, group: Group) -> Result<Self> {
        Self::from_group_with_probe(ctx, group, &FsLivenessProbe)
    }

    /// Same as [`Monitor::from_group`], but with an injectable [LivenessProbe] so callers (and
    /// this crate's own tests) can simulate the peer manager being present or absent.
    pub fn from_group_with_probe(
        ctx: Context,
        group: Group,
        probe: &dyn LivenessProbe,
    ) -> Result<Self> {
        let group = if group == Group::Peer && !probe.peer_is_running(&ctx) {
            ctx.log(
                LogPriority::Debug,
                "peer device manager does not appear to be running, downgrading monitor to none",
            );
            Group::None
        } else {
            group
        };

        // SAFETY: arguments are valid flag/protocol constants; the return value is checked
        // before use.
        let fd = unsafe {
            libc::socket(
                libc::PF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
                libc::NETLINK_KOBJECT_UEVENT,
            )
        };

        if fd < 0 {
            let err = io::Error::last_os_error();
            ctx.log(LogPriority::Error, format!("error getting socket: {err}"));
            return Err(Error::from(err));
        }

        Ok(Self::from_inner(MonitorInner {
            ctx,
            fd,
            group,
            local_addr: NetlinkAddr::new(group as u32),
            trusted_sender: None,
            default_destination: NetlinkAddr::new(Group::Peer as u32),
            subsystem_filter: SubsystemFilter::new(),
            tag_filter: TagFilter::new(),
            bound: false,
        }))
    }

    /// Adopts an already-open, already-bound netlink file descriptor (e.g. inherited from a
    /// parent process via a systemd-style socket handoff).
    pub fn from_fd(ctx: Context, group: Group, fd: RawFd) -> Result<Self> {
        let local_addr = NetlinkAddr::from_getsockname(fd)?;

        Ok(Self::from_inner(MonitorInner {
            ctx,
            fd,
            group,
            local_addr,
            trusted_sender: None,
            default_destination: NetlinkAddr::new(Group::Peer as u32),
            subsystem_filter: SubsystemFilter::new(),
            tag_filter: TagFilter::new(),
            bound: true,
        }))
    }

    /// Returns a non-owning [WeakMonitor] handle.
    pub fn downgrade(&self) -> WeakMonitor<D> {
        WeakMonitor(Arc::downgrade(&self.0), PhantomData)
    }

    /// The raw socket file descriptor, for integration into an external readiness loop.
    pub fn get_fd(&self) -> RawFd {
        self.lock().fd
    }

    /// The multicast group this monitor is bound to.
    pub fn group(&self) -> Group {
        self.lock().group
    }

    /// A copy of this monitor's [Context].
    pub fn context(&self) -> Context {
        self.lock().ctx.clone()
    }

    /// Whether the monitor's socket has been bound to its group.
    pub fn is_bound(&self) -> bool {
        self.lock().bound
    }

    /// Sets the kernel socket receive buffer size. Requires appropriate process privileges.
    pub fn set_receive_buffer_size(&self, size: i32) -> Result<()> {
        let inner = self.lock();

        // SAFETY: arguments are valid, and pointers reference valid, appropriately-sized memory.
        let ret = unsafe {
            libc::setsockopt(
                inner.fd,
                libc::SOL_SOCKET,
                libc::SO_RCVBUFFORCE,
                &size as *const i32 as *const _,
                mem::size_of::<i32>() as u32,
            )
        };

        if ret < 0 {
            let err = io::Error::last_os_error();
            inner
                .ctx
                .log(LogPriority::Error, format!("error setting receive buffer size: {err}"));
            Err(Error::from(err))
        } else {
            Ok(())
        }
    }

    /// Restricts delivery of unicast (`none`-group) datagrams to the given peer's port-id.
    pub fn allow_unicast_sender(&self, peer: &Self) -> Result<()> {
        let peer_port = peer.lock().local_addr.port_id();
        self.lock().trusted_sender = Some(peer_port);
        Ok(())
    }

    /// Adds a `(subsystem, devtype?)` entry to the subsystem filter. Takes effect on the next
    /// [`Monitor::filter_update`] (implicitly called by [`Monitor::enable_receiving`]).
    pub fn filter_add_subsystem_devtype(
        &self,
        subsystem: &str,
        devtype: Option<&str>,
    ) -> Result<()> {
        if subsystem.is_empty() {
            return Err(Error::InvalidArgument("empty subsystem filter".into()));
        }
        self.lock()
            .subsystem_filter
            .insert(subsystem.to_owned(), devtype.map(str::to_owned));
        Ok(())
    }

    /// Adds a tag to the tag filter. Re-adding an existing tag is a no-op success.
    pub fn filter_add_tag(&self, tag: &str) -> Result<()> {
        if tag.is_empty() {
            return Err(Error::InvalidArgument("empty tag filter".into()));
        }
        self.lock().tag_filter.insert(tag.to_owned());
        Ok(())
    }

    /// Recompiles and reinstalls the kernel filter from the current subsystem/tag filter state.
    /// A no-op if both collections are empty.
    pub fn filter_update(&self) -> Result<()> {
        self.lock().filter_update()
    }

    /// Clears both filter collections and installs an empty kernel filter, which the kernel
    /// treats as "no filter": every datagram the group delivers reaches user space.
    pub fn filter_remove(&self) -> Result<()> {
        let mut inner = self.lock();

        inner.subsystem_filter.clear();
        inner.tag_filter.clear();

        let mut fprog = libc::sock_fprog {
            len: 0,
            filter: std::ptr::null_mut(),
        };

        // SAFETY: `fprog` is a valid, empty `sock_fprog`; the kernel copies it before returning.
        let ret = unsafe {
            libc::setsockopt(
                inner.fd,
                libc::SOL_SOCKET,
                libc::SO_ATTACH_FILTER,
                &mut fprog as *mut libc::sock_fprog as *mut _,
                mem::size_of::<libc::sock_fprog>() as u32,
            )
        };

        if ret != 0 {
            Err(Error::from(io::Error::last_os_error()))
        } else {
            Ok(())
        }
    }

    /// Compiles and installs the filter, binds to the monitor's group if not already bound, reads
    /// back the kernel-assigned port, and enables receipt of sender credentials. Safe to call
    /// again on an already-bound monitor: only the filter reinstall and address readback repeat.
    pub fn enable_receiving(&self) -> Result<()> {
        let mut inner = self.lock();

        inner.filter_update()?;

        if !inner.bound {
            // SAFETY: `fd` is a valid socket; `local_addr` is a valid, appropriately-sized
            // `sockaddr_nl`.
            let ret = unsafe {
                libc::bind(
                    inner.fd,
                    inner.local_addr.as_ptr() as *const _,
                    mem::size_of::<libc::sockaddr_nl>() as u32,
                )
            };

            if ret < 0 {
                let err = io::Error::last_os_error();
                inner.ctx.log(LogPriority::Error, format!("bind failed: {err}"));
                return Err(Error::from(err));
            }

            inner.bound = true;
        }

        inner.local_addr = NetlinkAddr::from_getsockname(inner.fd)?;

        let on = 1i32;
        // SAFETY: arguments are valid, and pointers reference valid, appropriately-sized memory.
        let ret = unsafe {
            libc::setsockopt(
                inner.fd,
                libc::SOL_SOCKET,
                libc::SO_PASSCRED,
                &on as *const i32 as *const _,
                mem::size_of::<i32>() as u32,
            )
        };

        if ret < 0 {
            let err = io::Error::last_os_error();
            inner
                .ctx
                .log(LogPriority::Error, format!("setting SO_PASSCRED failed: {err}"));
            Err(Error::from(err))
        } else {
            Ok(())
        }
    }

    fn passes_filter(inner: &MonitorInner, device: &D) -> bool {
        let subsystem_ok = inner.subsystem_filter.is_empty()
            || inner.subsystem_filter.iter().any(|(subsystem, devtype)| {
                subsystem == device.subsystem()
                    && match devtype {
                        None => true,
                        Some(devtype) => device.devtype() == Some(devtype.as_str()),
                    }
            });

        if !subsystem_ok {
            return false;
        }

        inner.tag_filter.is_empty() || inner.tag_filter.iter().any(|tag| device.has_tag(tag))
    }

    /// Reads and processes exactly one datagram. Returns `Err(Error::Again(_))` for every policy
    /// rejection (malformed datagram, untrusted sender, missing/non-root credentials, or a
    /// datagram that fails the user-space safety-net filter); hard I/O failures propagate as
    /// `Err(Error::Kernel(_))`.
    pub fn receive_one(&self) -> Result<D> {
        let mut buf = [0u8; RECV_BUF_LEN];
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut _,
            iov_len: buf.len(),
        };
        let mut cred_buf = [0u8; mem::size_of::<libc::cmsghdr>() + mem::size_of::<libc::ucred>()];
        let mut src = NetlinkAddr::new(0);

        // SAFETY: `msghdr` is plain-old-data; every pointer field is filled in below before the
        // syscall, and all referenced buffers outlive the call.
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &mut iov as *mut _;
        msg.msg_iovlen = 1;
        msg.msg_control = cred_buf.as_mut_ptr() as *mut _;
        msg.msg_controllen = cred_buf.len();
        msg.msg_name = src.as_mut_ptr() as *mut _;
        msg.msg_namelen = mem::size_of::<libc::sockaddr_nl>() as u32;

        let fd = self.lock().fd;
        // SAFETY: `fd` is a valid, open socket; `msg` is fully initialized above.
        let buflen = unsafe { libc::recvmsg(fd, &mut msg as *mut _, 0) };

        if buflen < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Err(Error::Again("interrupted, retry".into()));
            }
            return Err(Error::from(err));
        }

        if buflen < 32 || msg.msg_flags & libc::MSG_TRUNC != 0 {
            return Err(Error::Again(format!("invalid message length: {buflen}")));
        }

        let buflen = buflen as usize;
        let inner = self.lock();

        match src.groups() {
            0 => match inner.trusted_sender {
                Some(trusted) if trusted == src.port_id() => {}
                _ => return Err(Error::Again("unicast netlink message ignored".into())),
            },
            g if g == Group::Kernel as u32 => {
                if src.port_id() != 0 {
                    return Err(Error::Again(format!(
                        "multicast kernel netlink message from PID {} ignored",
                        src.port_id()
                    )));
                }
            }
            _ => {}
        }

        let ucred = parse_cmsg(&cred_buf)?;
        if ucred.uid != 0 {
            return Err(Error::Again(format!(
                "sender uid={}, message ignored",
                ucred.uid
            )));
        }

        let (bufpos, initialized) = match NetlinkHeader::try_parse(&buf[..buflen]) {
            Ok(header) => {
                let off = header.properties_off() as usize;
                if off.saturating_add(32) > buflen {
                    return Err(Error::Again("properties offset exceeds buffer".into()));
                }
                (off, true)
            }
            Err(_) => {
                let header_end = buf[..buflen]
                    .iter()
                    .position(|&b| b == 0)
                    .map(|i| i + 1)
                    .unwrap_or(0);

                if header_end < "a@/d".len() || header_end >= buflen {
                    return Err(Error::Again(format!(
                        "invalid message length: buffer length {buflen}, header length {header_end}"
                    )));
                }
                if !buf[..header_end].windows(2).any(|w| w == b"@/") {
                    return Err(Error::Again("unrecognized message header".into()));
                }
                (header_end, false)
            }
        };

        let mut device = D::from_properties(&buf[bufpos..buflen])?;
        if initialized {
            device.set_initialized();
        }

        if !Self::passes_filter(&inner, &device) {
            return Err(Error::Again("device did not pass user-space filter".into()));
        }

        Ok(device)
    }

    /// Loops [`Monitor::receive_one`] until a device passes every filter, a hard error occurs, or
    /// the socket runs dry, in which case `Err(Error::Again(_))` is returned. Never blocks: an
    /// empty socket is checked with a zero-timeout `poll`, not a blocking read.
    pub fn receive_device(&self) -> Result<D> {
        for _ in 0..MAX_RECEIVE_ATTEMPTS {
            match self.receive_one() {
                Ok(device) => return Ok(device),
                Err(err) if err.is_again() => {
                    if !self.lock().has_queued_datagram()? {
                        return Err(err);
                    }
                }
                Err(err) => return Err(err),
            }
        }

        Err(Error::Again("receive retries exceeded".into()))
    }

    /// Serializes and sends a device, to an explicit destination monitor or (if `None`) this
    /// monitor's default peer-multicast destination.
    pub fn send_device(&self, destination: Option<&Self>, device: &D) -> Result<isize> {
        let props = device.serialize_properties();
        if props.len() < 32 {
            return Err(Error::InvalidArgument(
                "device buffer is too small to contain a valid device".into(),
            ));
        }

        let mut header = NetlinkHeader::new();
        header.set_properties_off(NetlinkHeader::SIZE as u32);
        header.set_properties_len(props.len() as u32);
        header.set_filter_subsystem_hash(hash32(device.subsystem()));
        if let Some(devtype) = device.devtype() {
            header.set_filter_devtype_hash(hash32(devtype));
        }

        let bloom = device.tags().fold(0u64, |acc, tag| acc | bloom64(tag));
        if bloom != 0 {
            header.set_filter_tag_bloom(bloom);
        }

        let header_bytes = header.to_bytes();
        let mut iov = [
            libc::iovec {
                iov_base: header_bytes.as_ptr() as *mut _,
                iov_len: header_bytes.len(),
            },
            libc::iovec {
                iov_base: props.as_ptr() as *mut _,
                iov_len: props.len(),
            },
        ];

        let inner = self.lock();
        let mut dest_addr = match destination {
            Some(dest) => dest.lock().local_addr,
            None => inner.default_destination,
        };

        // SAFETY: `msghdr` is plain-old-data; every pointer field is filled in below, and all
        // referenced buffers (`iov`, `dest_addr`) outlive the call.
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = iov.as_mut_ptr();
        msg.msg_iovlen = iov.len();
        msg.msg_name = dest_addr.as_mut_ptr() as *mut _;
        msg.msg_namelen = mem::size_of::<libc::sockaddr_nl>() as u32;

        // SAFETY: `fd` is a valid, open socket; `msg` is fully initialized above.
        let ret = unsafe { libc::sendmsg(inner.fd, &msg as *const _, 0) };

        if ret < 0 {
            let err = io::Error::last_os_error();
            if destination.is_none() && err.raw_os_error() == Some(libc::ECONNREFUSED) {
                inner.ctx.log(
                    LogPriority::Debug,
                    format!("passed device to netlink monitor: PID({})", dest_addr.port_id()),
                );
                Ok(0)
            } else {
                Err(Error::from(err))
            }
        } else {
            inner.ctx.log(
                LogPriority::Debug,
                format!(
                    "passed {ret} byte device to netlink monitor: PID({})",
                    dest_addr.port_id()
                ),
            );
            Ok(ret as isize)
        }
    }

    /// Closes the underlying socket early. Subsequent operations on this handle (or any clone)
    /// fail; [`MonitorInner::drop`] becomes a no-op for the fd.
    pub fn disconnect(&self) -> Result<()> {
        let mut inner = self.lock();

        if inner.fd >= 0 {
            // SAFETY: `fd` is a valid, open descriptor owned exclusively by this monitor.
            let ret = unsafe { libc::close(inner.fd) };
            inner.fd = -1;
            if ret < 0 {
                return Err(Error::from(io::Error::last_os_error()));
            }
        }

        inner.bound = false;
        Ok(())
    }
}

impl<D: Device> AsRawFd for Monitor<D> {
    fn as_raw_fd(&self) -> RawFd {
        self.get_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SimpleDevice;

    fn unbound_monitor() -> Monitor<SimpleDevice> {
        Monitor::from_group(Context::new(), Group::None).expect("socket() should succeed in CI")
    }

    #[test]
    fn test_from_group_creates_nonblocking_socket() {
        let monitor = unbound_monitor();
        assert!(monitor.get_fd() >= 0);
        assert!(!monitor.is_bound());
        assert_eq!(monitor.group(), Group::None);
    }

    #[test]
    fn test_clone_shares_state() {
        let monitor = unbound_monitor();
        let clone = monitor.clone();

        monitor.filter_add_tag("systemd").unwrap();
        assert_eq!(clone.lock().tag_filter.len(), 1);
    }

    #[test]
    fn test_weak_monitor_upgrade_after_drop() {
        let monitor = unbound_monitor();
        let weak = monitor.downgrade();
        assert!(weak.upgrade().is_some());

        drop(monitor);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_filter_add_rejects_empty_strings() {
        let monitor = unbound_monitor();
        assert!(monitor.filter_add_subsystem_devtype("", None).is_err());
        assert!(monitor.filter_add_tag("").is_err());
    }

    #[test]
    fn test_filter_remove_clears_state() {
        let monitor = unbound_monitor();
        monitor.filter_add_subsystem_devtype("net", None).unwrap();
        monitor.filter_add_tag("systemd").unwrap();

        monitor.filter_remove().unwrap();

        let inner = monitor.lock();
        assert!(inner.subsystem_filter.is_empty());
        assert!(inner.tag_filter.is_empty());
    }

    #[test]
    fn test_passes_filter_empty_filters_always_pass() {
        let monitor = unbound_monitor();
        let device = SimpleDevice::new().with_subsystem("net");
        assert!(Monitor::passes_filter(&monitor.lock(), &device));
    }

    #[test]
    fn test_passes_filter_subsystem_and_tag() {
        let monitor = unbound_monitor();
        monitor
            .filter_add_subsystem_devtype("usb", Some("usb_device"))
            .unwrap();
        monitor.filter_add_tag("systemd").unwrap();

        let matching = SimpleDevice::new()
            .with_subsystem("usb")
            .with_devtype("usb_device")
            .with_tag("systemd");
        assert!(Monitor::passes_filter(&monitor.lock(), &matching));

        let wrong_devtype = SimpleDevice::new()
            .with_subsystem("usb")
            .with_devtype("usb_interface")
            .with_tag("systemd");
        assert!(!Monitor::passes_filter(&monitor.lock(), &wrong_devtype));

        let missing_tag = SimpleDevice::new()
            .with_subsystem("usb")
            .with_devtype("usb_device");
        assert!(!Monitor::passes_filter(&monitor.lock(), &missing_tag));
    }

    #[test]
    fn test_send_device_rejects_undersize_properties() {
        let monitor = unbound_monitor();
        let tiny = SimpleDevice::new().with_subsystem("x");
        let err = monitor.send_device(None, &tiny).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }
}
