use std::{env, process};

use devmon::{Context, Group, Monitor, SimpleDevice};

/// Broadcasts a synthetic device to the peer multicast group, the way a device manager
/// rebroadcasts kernel uevents to its own subscribers.
fn main() -> devmon::Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    if args.len() != 2 {
        eprintln!("Usage: {} <subsystem>", args[0]);
        process::exit(1);
    }

    let monitor: Monitor<SimpleDevice> = Monitor::from_group(Context::new(), Group::Peer)?;
    monitor.enable_receiving()?;

    // `send_device` rejects any serialized properties buffer under 32 bytes (the real wire
    // protocol's minimum datagram size), so a subsystem and a tag alone are not always enough;
    // a DEVPATH property is always present on a real uevent and comfortably clears the floor.
    let device = SimpleDevice::new()
        .with_subsystem(args[1].as_str())
        .with_tag("systemd")
        .with_property("DEVPATH", format!("/devices/virtual/{}0", args[1]));

    let sent = monitor.send_device(None, &device)?;
    println!("sent {sent} bytes");

    Ok(())
}
