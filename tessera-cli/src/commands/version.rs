//! `tessera version` command

pub fn version() {
    println!("tessera {}", env!("CARGO_PKG_VERSION"));
}
