//! Configuration document and its validation
//!
//! Numeric fields are deserialized as `i64` so that out of range values are
//! reported by [`Config::validate`] with the offending value, instead of
//! failing to parse.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{de, Deserialize, Deserializer, Serialize};

use crate::error::ConfigError;
use crate::s7::S7Connector;
use crate::transport::BrokerSettings;
use crate::types::{MemoryRange, TopicBinding, TypedVariable, VariableKind, MAX_ADDRESS};

/// shortest accepted poll interval
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Root of the configuration document
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// IP address or host name of the MQTT broker
    #[serde(rename = "MqttBrokerIpAddress")]
    pub broker_host: String,
    /// TCP port of the MQTT broker, given as number or text
    #[serde(rename = "MqttBrokerPort", deserialize_with = "deserialize_port")]
    pub broker_port: i64,
    /// optional user name for the broker
    #[serde(rename = "MqttBrokerUsername", skip_serializing_if = "Option::is_none")]
    pub broker_username: Option<String>,
    /// optional password for the broker
    #[serde(rename = "MqttBrokerPassword", skip_serializing_if = "Option::is_none")]
    pub broker_password: Option<String>,
    /// controllers to bridge
    #[serde(rename = "Logos")]
    pub controllers: Vec<ControllerConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            broker_host: "localhost".to_string(),
            broker_port: 1883,
            broker_username: None,
            broker_password: None,
            controllers: Vec::new(),
        }
    }
}

/// A controller and the clients bound to its memory
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// IP address of the controller
    #[serde(rename = "IpAddress")]
    pub address: String,
    /// ranges of local variable memory to poll
    #[serde(rename = "MemoryRanges", default)]
    pub memory_ranges: Vec<MemoryRangeConfig>,
    /// MQTT clients and their topic bindings
    #[serde(rename = "Mqtt", default)]
    pub mqtt: Vec<MqttClientConfig>,
}

/// A polled range of local variable memory
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRangeConfig {
    /// first address
    #[serde(rename = "LocalVariableMemoryStart")]
    pub start: i64,
    /// last address (inclusive)
    #[serde(rename = "LocalVariableMemoryEnd")]
    pub end: i64,
    /// time between two polls in milliseconds
    #[serde(rename = "LocalVariableMemoryPollingCycleMilliseconds")]
    pub poll_interval_ms: i64,
}

/// An MQTT client connected on behalf of a controller
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MqttClientConfig {
    /// client identifier presented to the broker
    #[serde(rename = "ClientId")]
    pub client_id: String,
    /// variables published on change
    #[serde(rename = "Published", default)]
    pub published: Vec<ChannelConfig>,
    /// variables written from inbound messages
    #[serde(rename = "Subscribed", default)]
    pub subscribed: Vec<ChannelConfig>,
}

/// Binding between a topic and a typed variable
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// MQTT topic
    #[serde(rename = "Topic")]
    pub topic: String,
    /// address in local variable memory
    #[serde(rename = "LogoAddress")]
    pub address: i64,
    /// one of `bit`, `byte`, `integer`, `float`
    #[serde(rename = "Type")]
    pub kind: String,
    /// bit offset, only for `bit`, defaults to the lowest bit
    #[serde(rename = "Bit", default, skip_serializing_if = "Option::is_none")]
    pub bit: Option<i64>,
}

/// Accepts `6667` as well as `"6667"`
fn deserialize_port<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrText {
        Number(i64),
        Text(String),
    }

    match NumberOrText::deserialize(deserializer)? {
        NumberOrText::Number(x) => Ok(x),
        NumberOrText::Text(text) => text
            .trim()
            .parse()
            .map_err(|_| de::Error::custom(format!("'{text}' is not a port number"))),
    }
}

fn is_host_name(host: &str) -> bool {
    !host.is_empty()
        && host.len() <= 253
        && host.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}

fn check_address(field: &'static str, address: i64) -> Result<u16, ConfigError> {
    match u16::try_from(address) {
        Ok(x) if x <= MAX_ADDRESS => Ok(x),
        _ => Err(ConfigError::invalid(
            field,
            address,
            format!("should be 0..{MAX_ADDRESS}"),
        )),
    }
}

fn parse_kind(kind: &str) -> Result<VariableKind, ConfigError> {
    match kind {
        "bit" => Ok(VariableKind::Bit),
        "byte" => Ok(VariableKind::Byte),
        "integer" => Ok(VariableKind::Integer),
        "float" => Ok(VariableKind::Float),
        _ => Err(ConfigError::invalid(
            "Type",
            kind,
            "should be one of bit, byte, integer, float",
        )),
    }
}

impl Config {
    /// read the document at `path` without validating it
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// parse a JSON document without validating it
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    /// check every rule, returning the first violation
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.broker()?;
        for controller in &self.controllers {
            controller.validate()?;
        }
        Ok(())
    }

    /// connection settings of the broker
    pub fn broker(&self) -> Result<BrokerSettings, ConfigError> {
        if self.broker_host.parse::<IpAddr>().is_err() && !is_host_name(&self.broker_host) {
            return Err(ConfigError::invalid(
                "MqttBrokerIpAddress",
                &self.broker_host,
                "should be a valid IP address or host name",
            ));
        }

        let port = u16::try_from(self.broker_port).map_err(|_| {
            ConfigError::invalid("MqttBrokerPort", self.broker_port, "should be a valid port")
        })?;

        let credentials = match (&self.broker_username, &self.broker_password) {
            (Some(username), password) => Some((
                username.clone(),
                password.clone().unwrap_or_default(),
            )),
            (None, _) => None,
        };

        Ok(BrokerSettings {
            host: self.broker_host.clone(),
            port,
            credentials,
        })
    }
}

impl ControllerConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        self.endpoint()?;
        let ranges = self.ranges()?;
        for client in &self.mqtt {
            for binding in client.bindings()? {
                let variable = binding.variable;
                if !ranges
                    .iter()
                    .any(|r| r.contains(variable.address(), variable.width()))
                {
                    return Err(ConfigError::invalid(
                        "LogoAddress",
                        variable.address(),
                        format!(
                            "({}) is not covered by any memory range of {}",
                            variable.kind(),
                            self.address
                        ),
                    ));
                }
            }
        }
        Ok(())
    }

    /// socket address of the controller on the ISO-on-TCP port
    pub fn endpoint(&self) -> Result<SocketAddr, ConfigError> {
        let ip = self.address.parse::<IpAddr>().map_err(|_| {
            ConfigError::invalid("IpAddress", &self.address, "should be a valid IP address")
        })?;
        Ok(SocketAddr::new(ip, S7Connector::DEFAULT_PORT))
    }

    /// polled ranges in the order they are configured
    pub fn ranges(&self) -> Result<Vec<MemoryRange>, ConfigError> {
        self.memory_ranges.iter().map(|r| r.to_range()).collect()
    }
}

impl MemoryRangeConfig {
    /// the validated range
    pub fn to_range(&self) -> Result<MemoryRange, ConfigError> {
        let start = check_address("LocalVariableMemoryStart", self.start)?;
        let end = check_address("LocalVariableMemoryEnd", self.end)?;

        let size = self.end - self.start;
        if !(1..=i64::from(MAX_ADDRESS)).contains(&size) {
            return Err(ConfigError::invalid(
                "LocalVariableMemorySize",
                size,
                format!("should be 1..{MAX_ADDRESS}"),
            ));
        }

        let interval = u64::try_from(self.poll_interval_ms)
            .map(Duration::from_millis)
            .ok()
            .filter(|x| *x >= MIN_POLL_INTERVAL)
            .ok_or_else(|| {
                ConfigError::invalid(
                    "LocalVariableMemoryPollingCycleMilliseconds",
                    self.poll_interval_ms,
                    format!(
                        "polling cycle should be at least {} ms",
                        MIN_POLL_INTERVAL.as_millis()
                    ),
                )
            })?;

        MemoryRange::new(start, end, interval).map_err(|err| {
            ConfigError::invalid("LocalVariableMemoryEnd", self.end, err.to_string())
        })
    }
}

impl MqttClientConfig {
    /// all bindings of the client, published before subscribed
    pub fn bindings(&self) -> Result<Vec<TopicBinding>, ConfigError> {
        if self.client_id.is_empty() {
            return Err(ConfigError::invalid(
                "ClientId",
                &self.client_id,
                "should not be empty",
            ));
        }

        let published = self
            .published
            .iter()
            .map(|c| c.to_variable().map(|v| TopicBinding::publish(c.topic.clone(), v)));
        let subscribed = self
            .subscribed
            .iter()
            .map(|c| c.to_variable().map(|v| TopicBinding::subscribe(c.topic.clone(), v)));
        published.chain(subscribed).collect()
    }
}

impl ChannelConfig {
    /// the validated variable
    pub fn to_variable(&self) -> Result<TypedVariable, ConfigError> {
        if self.topic.is_empty() {
            return Err(ConfigError::invalid("Topic", &self.topic, "should not be empty"));
        }
        if self.topic.contains(['+', '#']) {
            return Err(ConfigError::invalid(
                "Topic",
                &self.topic,
                "should not contain the wildcards '+' or '#'",
            ));
        }

        let address = check_address("LogoAddress", self.address)?;
        let kind = parse_kind(&self.kind)?;

        let bit = match (kind, self.bit) {
            (VariableKind::Bit, bit) => {
                let bit = bit.unwrap_or(0);
                Some(
                    u8::try_from(bit)
                        .ok()
                        .filter(|x| *x <= 7)
                        .ok_or_else(|| ConfigError::invalid("Bit", bit, "should be 0..7"))?,
                )
            }
            (_, Some(bit)) => {
                return Err(ConfigError::invalid(
                    "Bit",
                    bit,
                    format!("is only allowed for bit channels, not {kind}"),
                ))
            }
            (_, None) => None,
        };

        TypedVariable::new(address, kind, bit)
            .map_err(|err| ConfigError::invalid("LogoAddress", address, err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn document(broker_host: &str, broker_port: &str, logo: &str) -> String {
        format!(
            r#"{{
                "MqttBrokerIpAddress": "{broker_host}",
                "MqttBrokerPort": "{broker_port}",
                "Logos": [{logo}]
            }}"#
        )
    }

    fn logo(address: &str, range: &str, channels: &str) -> String {
        format!(
            r#"{{
                "IpAddress": "{address}",
                "MemoryRanges": [{range}],
                "Mqtt": [{{ "ClientId": "logo1", {channels} }}]
            }}"#
        )
    }

    fn range(start: i64, end: i64, polling_cycle: i64) -> String {
        format!(
            r#"{{
                "LocalVariableMemoryPollingCycleMilliseconds": {polling_cycle},
                "LocalVariableMemoryStart": {start},
                "LocalVariableMemoryEnd": {end}
            }}"#
        )
    }

    fn channel(address: i64, kind: &str) -> String {
        format!(r#"{{ "Topic": "map/{address}", "LogoAddress": {address}, "Type": "{kind}" }}"#)
    }

    fn validate(text: &str) -> Result<(), ConfigError> {
        Config::from_json(text).unwrap().validate()
    }

    fn assert_invalid(text: &str, field: &str, value: &str, reason: &str) {
        match validate(text) {
            Err(ConfigError::Invalid {
                field: f,
                value: v,
                reason: r,
            }) => {
                assert_eq!(f, field);
                assert_eq!(v, value);
                assert!(r.contains(reason), "'{r}' does not contain '{reason}'");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    fn with_range(start: i64, end: i64, polling_cycle: i64) -> String {
        document(
            "5.6.7.8",
            "6667",
            &logo("1.2.3.4", &range(start, end, polling_cycle), r#""Published": []"#),
        )
    }

    fn with_channels(channels: &str) -> String {
        document(
            "some.where",
            "6667",
            &logo("1.2.3.4", &range(0, 850, 100), channels),
        )
    }

    fn valid_logo() -> String {
        logo("1.2.3.4", &range(0, 850, 100), r#""Published": []"#)
    }

    #[test]
    fn default_configuration_is_valid() {
        assert_eq!(Config::default().validate(), Ok(()));
        assert_eq!(Config::from_json("{}").unwrap(), Config::default());
    }

    #[test]
    fn reads_a_complete_document() {
        let text = r#"{
          "MqttBrokerIpAddress": "5.6.7.8",
          "MqttBrokerPort": "6667",
          "Logos": [
            {
              "IpAddress": "1.2.3.4",
              "MemoryRanges": [
                {
                  "LocalVariableMemoryPollingCycleMilliseconds": 10000,
                  "LocalVariableMemoryStart": 0,
                  "LocalVariableMemoryEnd": 128
                },
                {
                  "LocalVariableMemoryPollingCycleMilliseconds": 666,
                  "LocalVariableMemoryStart": 12,
                  "LocalVariableMemoryEnd": 42
                }
              ],
              "Mqtt": [
                {
                  "ClientId": "mqtt-client-id",
                  "Subscribed": [
                    { "Topic": "map/21/31/set", "LogoAddress": 21, "Type": "byte" },
                    { "Topic": "map/22/32/set", "LogoAddress": 22, "Type": "integer" },
                    { "Topic": "map/26/36/set", "LogoAddress": 26, "Type": "float" }
                  ],
                  "Published": [
                    { "Topic": "map/120/130/get", "LogoAddress": 120, "Type": "bit" },
                    { "Topic": "map/121/131/get", "LogoAddress": 121, "Type": "byte" },
                    { "Topic": "map/122/132/get", "LogoAddress": 122, "Type": "integer" },
                    { "Topic": "map/126/136/get", "LogoAddress": 126, "Type": "float" }
                  ]
                }
              ]
            }
          ]
        }"#;
        let config = Config::from_json(text).unwrap();

        assert_eq!(config.broker_host, "5.6.7.8");
        assert_eq!(config.broker_port, 6667);
        assert_eq!(config.controllers.len(), 1);

        let logo = &config.controllers[0];
        assert_eq!(logo.address, "1.2.3.4");
        assert_eq!(logo.endpoint().unwrap(), "1.2.3.4:102".parse().unwrap());
        assert_eq!(
            logo.memory_ranges,
            vec![
                MemoryRangeConfig {
                    start: 0,
                    end: 128,
                    poll_interval_ms: 10000,
                },
                MemoryRangeConfig {
                    start: 12,
                    end: 42,
                    poll_interval_ms: 666,
                },
            ]
        );
        assert_eq!(logo.memory_ranges[0].to_range().unwrap().size(), 129);

        let client = &logo.mqtt[0];
        assert_eq!(client.client_id, "mqtt-client-id");
        let subscribed: Vec<_> = client
            .subscribed
            .iter()
            .map(|c| (c.topic.as_str(), c.address, c.kind.as_str()))
            .collect();
        assert_eq!(
            subscribed,
            vec![
                ("map/21/31/set", 21, "byte"),
                ("map/22/32/set", 22, "integer"),
                ("map/26/36/set", 26, "float"),
            ]
        );
        let published: Vec<_> = client
            .published
            .iter()
            .map(|c| (c.topic.as_str(), c.address, c.kind.as_str()))
            .collect();
        assert_eq!(
            published,
            vec![
                ("map/120/130/get", 120, "bit"),
                ("map/121/131/get", 121, "byte"),
                ("map/122/132/get", 122, "integer"),
                ("map/126/136/get", 126, "float"),
            ]
        );

        let bindings = client.bindings().unwrap();
        assert_eq!(
            bindings[0],
            TopicBinding::publish("map/120/130/get", TypedVariable::bit(120, 0).unwrap())
        );
        assert_eq!(
            bindings[5],
            TopicBinding::subscribe("map/22/32/set", TypedVariable::integer(22).unwrap())
        );
        assert_eq!(bindings.len(), 7);
    }

    #[test]
    fn accepts_the_port_as_number_or_text() {
        let text = r#"{ "MqttBrokerIpAddress": "5.6.7.8", "MqttBrokerPort": 6667 }"#;
        assert_eq!(Config::from_json(text).unwrap().broker_port, 6667);
        let text = r#"{ "MqttBrokerIpAddress": "5.6.7.8", "MqttBrokerPort": " 6667 " }"#;
        assert_eq!(Config::from_json(text).unwrap().broker_port, 6667);
    }

    #[test]
    fn credentials_are_optional() {
        let mut config = Config::default();
        assert_eq!(config.broker().unwrap().credentials, None);

        let text = r#"{ "MqttBrokerUsername": "user", "MqttBrokerPassword": "secret" }"#;
        config = Config::from_json(text).unwrap();
        assert_eq!(
            config.broker().unwrap().credentials,
            Some(("user".to_string(), "secret".to_string()))
        );
    }

    #[test]
    fn rejects_invalid_broker_host() {
        assert_invalid(
            &document("some\\\\where", "6667", &valid_logo()),
            "MqttBrokerIpAddress",
            "some\\where",
            "should be a valid IP address or host name",
        );
    }

    #[test]
    fn accepts_host_names() {
        let text = document("some.where", "6667", &valid_logo());
        assert_eq!(validate(&text), Ok(()));
    }

    #[test]
    fn rejects_broker_port_out_of_range() {
        for port in ["-1", "65536"] {
            assert_invalid(
                &document("some.where", port, &valid_logo()),
                "MqttBrokerPort",
                port,
                "should be a valid port",
            );
        }
    }

    #[test]
    fn rejects_invalid_controller_address() {
        let text = document(
            "5.6.7.8",
            "6667",
            &logo("1.2.3.4.5", &range(0, 850, 100), r#""Published": []"#),
        );
        assert_invalid(&text, "IpAddress", "1.2.3.4.5", "should be a valid IP address");
    }

    #[test]
    fn rejects_range_bounds_outside_of_memory() {
        assert_invalid(
            &with_range(-1, 850, 10000),
            "LocalVariableMemoryStart",
            "-1",
            "0..850",
        );
        assert_invalid(
            &with_range(0, 851, 10000),
            "LocalVariableMemoryEnd",
            "851",
            "0..850",
        );
    }

    #[test]
    fn rejects_ranges_smaller_than_one() {
        assert_invalid(
            &with_range(0, 0, 10000),
            "LocalVariableMemorySize",
            "0",
            "1..850",
        );
        assert_invalid(
            &with_range(10, 9, 100),
            "LocalVariableMemorySize",
            "-1",
            "1..850",
        );
    }

    #[test]
    fn accepts_the_smallest_range() {
        assert_eq!(validate(&with_range(10, 11, 100)), Ok(()));
    }

    #[test]
    fn rejects_polling_cycles_below_100_ms() {
        assert_invalid(
            &with_range(0, 850, 99),
            "LocalVariableMemoryPollingCycleMilliseconds",
            "99",
            "polling cycle should be at least 100 ms",
        );
    }

    #[test]
    fn rejects_channel_addresses_outside_of_memory() {
        for (direction, address) in [("Published", 851), ("Published", -1), ("Subscribed", 851)] {
            let channels = format!(
                r#""{direction}": [{}, {}]"#,
                channel(0, "byte"),
                channel(address, "byte")
            );
            assert_invalid(
                &with_channels(&channels),
                "LogoAddress",
                &address.to_string(),
                "should be 0..850",
            );
        }
    }

    #[test]
    fn rejects_variables_that_do_not_fit_into_memory() {
        let channels = format!(r#""Published": [{}]"#, channel(848, "float"));
        assert_invalid(&with_channels(&channels), "LogoAddress", "848", "past the end");
    }

    #[test]
    fn rejects_channels_outside_of_every_range() {
        let channels = format!(r#""Subscribed": [{}]"#, channel(19, "integer"));
        let text = document(
            "some.where",
            "6667",
            &logo("1.2.3.4", &range(0, 19, 100), &channels),
        );
        assert_invalid(&text, "LogoAddress", "19", "not covered by any memory range");
    }

    #[test]
    fn bit_channels_default_to_the_lowest_bit() {
        let config = Config::from_json(&with_channels(
            r#""Published": [{ "Topic": "t", "LogoAddress": 1, "Type": "bit" }]"#,
        ))
        .unwrap();
        assert_eq!(
            config.controllers[0].mqtt[0].published[0].to_variable(),
            Ok(TypedVariable::bit(1, 0).unwrap())
        );

        let config = Config::from_json(&with_channels(
            r#""Published": [{ "Topic": "t", "LogoAddress": 1, "Type": "bit", "Bit": 6 }]"#,
        ))
        .unwrap();
        assert_eq!(
            config.controllers[0].mqtt[0].published[0].to_variable(),
            Ok(TypedVariable::bit(1, 6).unwrap())
        );
    }

    #[test]
    fn checks_bit_offsets() {
        let cases = [
            (r#""Type": "bit", "Bit": 8"#, "should be 0..7"),
            (r#""Type": "bit", "Bit": -1"#, "should be 0..7"),
            (r#""Type": "byte", "Bit": 1"#, "only allowed for bit channels"),
        ];
        for (fields, reason) in cases {
            let channels =
                format!(r#""Published": [{{ "Topic": "t", "LogoAddress": 1, {fields} }}]"#);
            match validate(&with_channels(&channels)) {
                Err(ConfigError::Invalid {
                    field, reason: r, ..
                }) => {
                    assert_eq!(field, "Bit");
                    assert!(r.contains(reason), "{r}");
                }
                other => panic!("unexpected result: {other:?}"),
            }
        }
    }

    #[test]
    fn rejects_unknown_types_and_empty_topics() {
        let channels = format!(r#""Published": [{}]"#, channel(1, "double"));
        assert_invalid(&with_channels(&channels), "Type", "double", "should be one of");

        let channels = r#""Published": [{ "Topic": "", "LogoAddress": 1, "Type": "byte" }]"#;
        assert_invalid(&with_channels(channels), "Topic", "", "should not be empty");
    }

    #[test]
    fn rejects_wildcard_topics() {
        for topic in ["map/+/set", "map/#", "#"] {
            let channels = format!(
                r#""Subscribed": [{{ "Topic": "{topic}", "LogoAddress": 1, "Type": "byte" }}]"#
            );
            assert_invalid(&with_channels(&channels), "Topic", topic, "wildcards");
        }
    }

    #[test]
    fn reports_malformed_documents() {
        assert!(matches!(
            Config::from_json(r#"{ "MqttBrokerPort": "abc" }"#),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            Config::from_json(r#"{ "MqttBrokerPort": true }"#),
            Err(ConfigError::Parse(_))
        ));
        assert_eq!(
            Config::from_file("/does/not/exist.json"),
            Err(ConfigError::Io(std::io::ErrorKind::NotFound))
        );
    }
}
