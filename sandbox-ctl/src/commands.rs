use log::info;
use sandbox_rs::{EmulatorImage, SystemCapabilities, util};

pub fn check_requirements() {
    info!("Checking sandbox requirements");
    println!("Checking sandbox requirements...\n");

    let caps = SystemCapabilities::detect();
    println!("{}", caps.summary());

    match EmulatorImage::locate() {
        Ok(path) => println!("[ok] Preload {}", path.display()),
        Err(err) => println!("[--] Preload: {}", err),
    }

    if caps.can_launch() {
        println!("\nThis host can launch sandboxes.");
    } else {
        println!("\nThis host cannot launch sandboxes.");
    }

    println!("\nSystem info:");
    println!("  UID: {}", util::get_uid());
    println!("  GID: {}", util::get_gid());
}
