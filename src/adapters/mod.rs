//! Adapters: concrete implementations of the hexagonal port traits.
//!
//! | Adapter     | Implements     | Connects to                        |
//! |-------------|----------------|------------------------------------|
//! | `device_id` | -              | Factory MAC (eFuse)                |
//! | `http`      | HttpPort       | esp-http-client (+ cert bundle)    |
//! | `mdns`      | DiscoveryPort  | ESP-IDF mDNS component             |
//! | `mqtt`      | MqttPort       | esp-mqtt client                    |
//! | `nvs`       | ConfigPort     | NVS / in-memory store              |
//! |             | StoragePort    |                                    |
//! | `sensors`   | SensorPort     | ESP32 ADC1 (NTC + humidity)        |
//! | `system`    | SystemPort     | esp-ota, esp_restart               |
//! | `time`      | -              | ESP32 system timer                 |
//! | `wifi`      | -              | ESP-IDF WiFi STA                   |

pub mod device_id;
pub mod http;
pub mod mdns;
pub mod mqtt;
pub mod nvs;
pub mod sensors;
pub mod system;
pub mod time;
pub mod wifi;
