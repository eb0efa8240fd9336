fn main() {
    // Host builds (simulation binary, tests) need none of the ESP-IDF link
    // arguments; only emit them when actually targeting the device.
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("espidf") {
        embuild::espidf::sysenv::output();
    }
}
