//! IBM Watson IoT Platform transport: a thin veneer over the MQTT codec
//! that maps a `watson://org/device_type/device_id` address onto the
//! platform's broker host, application client ID and command/event
//! topic scheme.

use rand::Rng;
use url::Url;

use crate::error::{CodecError, Result};
use crate::mqtt::{mqtt, MqttCodec, MqttOptions};

#[derive(Debug, Clone, Default)]
pub struct WatsonOptions {
    /// Application ID. A random one is generated when empty.
    pub app_id: String,
    pub api_key: String,
    pub api_auth_token: String,
}

/// Connects to the Watson IoT Platform broker for the device named by
/// `url`.
pub async fn watson(url: &str, opts: &WatsonOptions) -> Result<MqttCodec> {
    let (broker_url, mqtt_opts) = broker_config(url, opts)?;
    mqtt(&broker_url, &mqtt_opts).await
}

/// Maps a Watson device address onto broker URL and MQTT options.
pub(crate) fn broker_config(url: &str, opts: &WatsonOptions) -> Result<(String, MqttOptions)> {
    let parsed = Url::parse(url).map_err(|e| CodecError::address(url, e.to_string()))?;
    if parsed.scheme() != "watson" {
        return Err(CodecError::address(url, "expected watson:// scheme"));
    }
    let org = parsed
        .host_str()
        .ok_or_else(|| CodecError::address(url, "missing organization"))?;
    let segments: Vec<&str> = parsed
        .path()
        .trim_start_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();
    let [device_type, device_id] = segments.as_slice() else {
        return Err(CodecError::address(
            url,
            "expected watson://org/device_type/device_id",
        ));
    };

    let app_id = if opts.app_id.is_empty() {
        format!("mgrpc-{:08x}", rand::thread_rng().gen::<u32>())
    } else {
        opts.app_id.clone()
    };

    let broker_url = format!("mqtts://{org}.messaging.internetofthings.ibmcloud.com:8883");
    let mqtt_opts = MqttOptions {
        user: opts.api_key.clone(),
        password: opts.api_auth_token.clone(),
        client_id: format!("a:{org}:{app_id}"),
        pub_topic: format!("iot-2/type/{device_type}/id/{device_id}/cmd/mgrpc-{device_id}/fmt/json"),
        sub_topic: format!("iot-2/type/{device_type}/id/+/evt/mgrpc-{app_id}/fmt/json"),
        src: app_id,
    };
    Ok((broker_url, mqtt_opts))
}
