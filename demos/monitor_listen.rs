use std::{thread, time};

use devmon::{Context, Group, Monitor, SimpleDevice};

fn main() -> devmon::Result<()> {
    env_logger::init();

    let monitor: Monitor<SimpleDevice> = Monitor::from_group(Context::new(), Group::Kernel)?;
    monitor.enable_receiving()?;

    loop {
        match monitor.receive_device() {
            Ok(device) => println!("{device:?}"),
            Err(err) if err.is_again() => thread::sleep(time::Duration::from_millis(200)),
            Err(err) => return Err(err),
        }
    }
}
