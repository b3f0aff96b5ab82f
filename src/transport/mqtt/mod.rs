//! Hub MQTT client
//!
//! The client is split the same way as the rest of the transport code: pure
//! functions are separated from I/O so they can be tested without a broker.
//!
//! - [`connection`] - MQTT options, TLS setup, hub topic naming, error classification
//! - [`message_handler`] - event routing and topic parsing
//! - [`client`] - the rumqttc client, event loop task and request correlation
//!
//! # Usage
//!
//! ```rust,no_run
//! use device_agent::transport::mqtt::HubMqttClient;
//! use device_agent::transport::{Credential, DeviceIdentity, Transport};
//! use device_agent::config::CredentialsSection;
//!
//! # tokio_test::block_on(async {
//! let identity = DeviceIdentity::from_connection_string(
//!     "HostName=my-hub.azure-devices.net;DeviceId=device0;x509=true",
//! )?;
//! let credential = Credential::load(&CredentialsSection::default())?;
//!
//! let client = HubMqttClient::new();
//! client.connect(&identity, &credential).await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod message_handler;

pub use client::HubMqttClient;
pub use connection::{configure_mqtt_options, TopicBuilder};
pub use message_handler::{EventRoute, MessageHandler};
