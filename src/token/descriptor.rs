use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Smallest display dimension forwarded to the gateway, in pixels.
pub const MIN_DISPLAY_PX: u32 = 100;

/// Settings keys that have their own field and must never appear in the
/// free-form options, or the serialized settings would carry them twice.
const NAMED_SETTINGS: [&str; 6] = ["hostname", "port", "username", "password", "width", "height"];

/// Connection parameters the gateway needs to bridge a browser to a desktop.
///
/// Serialises as `{"connection":{"type":..,"settings":{..}}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    pub connection: Connection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    #[serde(rename = "type")]
    pub protocol: String,
    pub settings: ConnectionSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionSettings {
    pub hostname: String,
    #[serde(deserialize_with = "port_as_string")]
    pub port: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    /// Remaining protocol options, passed through untouched.
    #[serde(flatten)]
    pub options: Map<String, Value>,
}

fn port_as_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "port must be a string or number, got {}",
            other
        ))),
    }
}

impl ConnectionDescriptor {
    pub fn new(protocol: impl Into<String>, hostname: impl Into<String>, port: impl ToString) -> Self {
        Self {
            connection: Connection {
                protocol: protocol.into(),
                settings: ConnectionSettings {
                    hostname: hostname.into(),
                    port: port.to_string(),
                    username: None,
                    password: None,
                    width: None,
                    height: None,
                    options: Map::new(),
                },
            },
        }
    }

    pub fn rdp(hostname: impl Into<String>, port: impl ToString) -> Self {
        Self::new("rdp", hostname, port)
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        let settings = &mut self.connection.settings;
        settings.username = Some(username.into()).filter(|u| !u.is_empty());
        settings.password = Some(password.into()).filter(|p| !p.is_empty());
        self
    }

    /// Merge untrusted width/height hints. Each hint is coerced to an integer
    /// and raised to [`MIN_DISPLAY_PX`]; hints that are not numbers are dropped.
    pub fn with_display_hints(mut self, width: Option<&Value>, height: Option<&Value>) -> Self {
        let settings = &mut self.connection.settings;
        if let Some(w) = width.and_then(sanitize_dimension) {
            settings.width = Some(w);
        }
        if let Some(h) = height.and_then(sanitize_dimension) {
            settings.height = Some(h);
        }
        self
    }

    /// Set a protocol option. `width` and `height` go through the same
    /// sanitising as display hints; other keys that name a dedicated
    /// setting are ignored.
    pub fn with_option(mut self, key: impl Into<String>, value: Value) -> Self {
        let key = key.into();
        match key.as_str() {
            "width" => return self.with_display_hints(Some(&value), None),
            "height" => return self.with_display_hints(None, Some(&value)),
            k if NAMED_SETTINGS.contains(&k) => {
                tracing::debug!(option = %k, "Ignoring option that shadows a connection setting");
            }
            _ => {
                self.connection.settings.options.insert(key, value);
            }
        }
        self
    }

    /// Raise any display dimension below the minimum and drop options that
    /// shadow a dedicated setting. A shadowing `width`/`height` option only
    /// fills in a missing dimension, after sanitising.
    pub fn sanitized(mut self) -> Self {
        let settings = &mut self.connection.settings;
        for key in NAMED_SETTINGS {
            let Some(value) = settings.options.remove(key) else {
                continue;
            };
            match key {
                "width" if settings.width.is_none() => settings.width = sanitize_dimension(&value),
                "height" if settings.height.is_none() => settings.height = sanitize_dimension(&value),
                _ => {}
            }
        }
        settings.width = settings.width.map(|w| w.max(MIN_DISPLAY_PX));
        settings.height = settings.height.map(|h| h.max(MIN_DISPLAY_PX));
        self
    }

    pub fn hostname(&self) -> &str {
        &self.connection.settings.hostname
    }

    pub fn port(&self) -> &str {
        &self.connection.settings.port
    }
}

/// Coerce a display hint to whole pixels, at least [`MIN_DISPLAY_PX`].
pub fn sanitize_dimension(hint: &Value) -> Option<u32> {
    let raw = match hint {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if !raw.is_finite() {
        return None;
    }
    let px = raw.floor().max(MIN_DISPLAY_PX as f64).min(u32::MAX as f64);
    Some(px as u32)
}
