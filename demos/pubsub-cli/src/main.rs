// Copyright 2025 The Drasi Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Interactive publish/subscribe client.
//!
//! Reads `topic@message` lines from stdin and publishes `message` to
//! `topic/<client id>`. Replies on `pingres/<client id>` are printed.
//! Typing `disconnect` closes the connection.

use std::env;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::info;
use mqtt_facade::config::{qos_from_level, CLIENT_LOGGER_TARGET, MESSAGE_LOGGER_TARGET};
use mqtt_facade::{MqttClient, MqttClientConfig, QoS, SubscribeOptions, TargetLogger};
use tokio::io::{AsyncBufReadExt, BufReader};

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn config_from_env() -> Result<MqttClientConfig> {
    let client_id = env::var("MQTT_CLIENT_ID").unwrap_or_else(|_| uuid::Uuid::new_v4().to_string());
    let qos = match env::var("MQTT_QOS") {
        Ok(level) => qos_from_level(level.parse().context("MQTT_QOS must be 0, 1 or 2")?)?,
        Err(_) => QoS::AtMostOnce,
    };
    let clean_session = match env::var("MQTT_CLEAN_SESSION") {
        Ok(flag) => flag.parse().context("MQTT_CLEAN_SESSION must be true or false")?,
        Err(_) => true,
    };

    Ok(MqttClientConfig::builder(
        env_or("MQTT_ADDR", "127.0.0.1:1883"),
        env_or("MQTT_USERNAME", ""),
        env_or("MQTT_PASSWORD", ""),
        client_id,
    )
    .clean_session(clean_session)
    .qos(qos)
    .client_logger(Arc::new(TargetLogger::new(CLIENT_LOGGER_TARGET)))
    .message_logger(Arc::new(TargetLogger::new(MESSAGE_LOGGER_TARGET)))
    .build())
}

async fn handle_line(client: &MqttClient, line: &str) {
    let Some((topic, message)) = line.split_once('@') else {
        println!("message format mismatch");
        return;
    };
    if message.contains('@') {
        println!("message format mismatch");
        return;
    }

    let topic = format!("{topic}/{}", client.client_id());
    match client.publish(&topic, message).await {
        Ok(()) => println!("pub {topic} {message}"),
        Err(e) => println!("{e}"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = config_from_env()?;
    info!("Starting pubsub client '{}'...", config.client_id);

    let client = MqttClient::connect(config)
        .await
        .context("failed to connect to MQTT broker")?;

    let reply_topic = format!("pingres/{}", client.client_id());
    client
        .subscribe_with(
            &reply_topic,
            |topic: &str, message: &str| -> anyhow::Result<()> {
                println!("sub {topic} {message}");
                Ok(())
            },
            SubscribeOptions::new().without_log(),
        )
        .await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut connected = true;
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                let line = line.trim();
                if line == "disconnect" {
                    if connected {
                        client.disconnect().await;
                        connected = false;
                    }
                    continue;
                }
                handle_line(&client, line).await;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    if connected {
        client.disconnect().await;
    }
    Ok(())
}
