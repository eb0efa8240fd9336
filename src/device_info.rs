/// Get the device serial number based on the factory-programmed MAC address.
#[cfg(target_os = "espidf")]
pub fn get_device_serial_number() -> String {
    // The default MAC from efuse is unique per chip.
    let mut mac = [0u8; 6];
    unsafe {
        esp_idf_svc::sys::esp_efuse_mac_get_default(mac.as_mut_ptr());
    }
    format!(
        "{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}

/// Host builds have no efuse; use a fixed placeholder so derived identifiers
/// stay deterministic in simulation and tests.
#[cfg(not(target_os = "espidf"))]
pub fn get_device_serial_number() -> String {
    "000000000000".to_string()
}

/// Broker client identity, derived deterministically from hardware identity.
pub fn broker_client_id() -> String {
    format!("esp32lab-{}", get_device_serial_number())
}
