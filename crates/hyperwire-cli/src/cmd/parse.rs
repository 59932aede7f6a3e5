//! `hyperwire parse`: validate an address and show its parts.

use crate::ui;
use hyperwire_types::Address;

pub fn cmd_parse(input: &str) {
    match Address::parse(input) {
        Ok(address) => {
            ui::section("Address");
            ui::kv("Node", address.node());
            ui::kv("Process", address.process().process_name());
            ui::kv("Package", address.process().package_name());
            ui::kv("Publisher", address.process().publisher());
            ui::kv_ok("Canonical", &address.to_string());
        }
        Err(e) => {
            ui::error_with_fix(&e.to_string(), "Use the form node@process:package:publisher");
            std::process::exit(1);
        }
    }
}
