// esp32lab core
// Task orchestration and resilient connectivity for the lab device: the
// inter-task message bus, the boot state machine, the wireless and broker
// connection managers, the tri-signal status indicator, and the serialized
// I2C text panel arbiter. Hardware sits behind trait seams; the ESP-IDF
// backends compile only for the device target.

pub mod builtin_settings;
pub mod config;
pub mod device_info;
pub mod i2c_arbiter;
pub mod led_manager;
pub mod message_bus;
pub mod mqtt_manager;
pub mod orchestrator;
pub mod stub_tasks;
pub mod system_state;
pub mod wifi_manager;

#[cfg(target_os = "espidf")]
pub mod hardware;
