// build.rs

use clap::{Arg, ArgAction, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;

fn flag(id: &'static str, help: &'static str) -> Arg {
    Arg::new(id).long(id).action(ArgAction::SetTrue).help(help)
}

fn build_cli() -> Command {
    Command::new("aptd")
        .version(env!("CARGO_PKG_VERSION"))
        .author("aptd Contributors")
        .about("Transaction daemon for APT: queued, authorized package operations over D-Bus")
        .arg(flag("debug", "Show internals").short('d'))
        .arg(flag("dummy", "Do not make any changes to the system"))
        .arg(flag("disable-timeout", "Do not shut down the daemon because of inactivity").short('t'))
        .arg(flag("replace", "Quit and replace an already running daemon").short('r'))
        .arg(flag("session-bus", "Listen on the D-Bus session bus (only for testing)"))
        .arg(flag("disable-plugins", "Do not run resolver plugins"))
        .arg(
            Arg::new("chroot")
                .long("chroot")
                .short('c')
                .value_name("DIR")
                .help("Perform operations in the given chroot"),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("FILE")
                .default_value("/etc/aptd/aptd.toml")
                .help("Configuration file"),
        )
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let manifest_dir = match env::var("CARGO_MANIFEST_DIR") {
        Ok(dir) => PathBuf::from(dir),
        Err(e) => {
            println!("cargo:warning=CARGO_MANIFEST_DIR not set: {}", e);
            return;
        }
    };
    let man_dir = manifest_dir.join("man");

    if let Err(e) = fs::create_dir_all(&man_dir) {
        println!("cargo:warning=Failed to create man directory: {}", e);
        return;
    }

    let man = Man::new(build_cli());
    let mut buffer = Vec::new();
    if let Err(e) = man.render(&mut buffer) {
        println!("cargo:warning=Failed to render man page: {}", e);
        return;
    }

    let man_path = man_dir.join("aptd.8");
    if let Err(e) = fs::write(&man_path, buffer) {
        println!("cargo:warning=Failed to write man page: {}", e);
    }
}
