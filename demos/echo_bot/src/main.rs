//! Echo Bot Example
//!
//! A console bot showing the main pieces of Brass:
//!
//! - `/echo <text>` replies with the text (blocking command)
//! - `/count` counts messages per conversation using conversation state
//! - `/hello` greets using the `[plugins.greeter]` config section
//! - `/ask` waits for the next line in the same conversation
//! - `/fail` returns an error; other plugins are unaffected
//! - `/reload` rebuilds the plugin set through the reload handle
//! - `/help` lists the commands
//!
//! # Usage
//!
//! ```bash
//! cargo run --package echo-bot -- --config demos/echo_bot/brass.toml
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use brass::prelude::*;
use clap::Parser;
use serde::Deserialize;

const HELP: &str = "\
/echo <text>  echo text
/count        messages seen in this conversation
/hello        greeting from config
/ask          ask a question and wait for the answer
/fail         a plugin that always fails
/reload       reload the plugin set
/help         this help";

#[derive(Debug, Parser)]
#[command(name = "echo-bot", about = "Console echo bot built on Brass")]
struct Args {
    /// Configuration file (defaults to ./brass.toml when present).
    #[arg(short, long, env = "BRASS_CONFIG")]
    config: Option<PathBuf>,

    /// Configuration profile, e.g. "production".
    #[arg(short, long)]
    profile: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct GreeterConfig {
    greeting: String,
}

impl Default for GreeterConfig {
    fn default() -> Self {
        Self {
            greeting: "Hi".into(),
        }
    }
}

// ============================================================================
// Plugins
// ============================================================================

fn plugins(reload: ReloadHandle) -> Vec<PluginDescriptor> {
    vec![
        on_message()
            .name("logging")
            .priority(-10)
            .handler(|cx| async move {
                let event = cx.event();
                info!(
                    conversation = ?event.conversation_id().map(|c| c.as_str()),
                    text = event.plain_text(),
                    "message received"
                );
                Ok(Outcome::Pass)
            }),
        on_message().name("counter").handler(|cx| async move {
            if let Some(state) = cx.conversation_state() {
                state.update("seen", |v| (v.and_then(|v| v.as_u64()).unwrap_or(0) + 1).into())?;
            }
            Ok(Outcome::Pass)
        }),
        on_command("count").block(true).handler(|cx| async move {
            let seen: u64 = match cx.conversation_state() {
                Some(state) => state.get_as("seen")?.unwrap_or(0),
                None => 0,
            };
            cx.reply(format!("{seen} message(s) so far")).await?;
            Ok(Outcome::Handled)
        }),
        on_command("echo").block(true).handler(|cx| async move {
            let text = strip_command(cx.event().plain_text(), "echo").unwrap_or_default();
            if !text.is_empty() {
                cx.reply(text).await?;
            }
            Ok(Outcome::Handled)
        }),
        on_command("hello")
            .name("greeter")
            .block(true)
            .handler(|cx| async move {
                let config: GreeterConfig = cx.config()?;
                cx.reply(format!("{}!", config.greeting)).await?;
                Ok(Outcome::Handled)
            }),
        on_command("ask")
            .block(true)
            // Outlasts the 30 s wait for an answer.
            .timeout(Duration::from_secs(60))
            .handler(|cx| async move {
                cx.reply("What is your favourite colour?").await?;
                match cx.next_event(Duration::from_secs(30)).await {
                    Some(answer) => {
                        cx.reply(format!("{} is a fine colour.", answer.plain_text().trim()))
                            .await?
                    }
                    None => cx.reply("Never mind.").await?,
                };
                Ok(Outcome::Handled)
            }),
        on_command("fail").handler(|_cx| async move {
            anyhow::bail!("this plugin always fails")
        }),
        on_command("reload").block(true).handler(move |cx| {
            let reload = reload.clone();
            async move {
                let generation = reload.refresh().await?;
                cx.reply(format!("plugins reloaded (generation {generation})"))
                    .await?;
                Ok(Outcome::Handled)
            }
        }),
        on_command("help").block(true).handler(|cx| async move {
            cx.reply(HELP).await?;
            Ok(Outcome::Handled)
        }),
    ]
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut builder = BrassRuntime::builder();
    if let Some(path) = &args.config {
        builder = builder.config_file(path);
    }
    if let Some(profile) = &args.profile {
        builder = builder.profile(profile.as_str());
    }
    let runtime = builder.build()?;

    runtime.register_adapter::<ConsoleAdapter>().await?;

    let reload = runtime.reload_handle();
    runtime.register_plugins(plugins(reload.clone()))?;
    runtime.set_plugin_source(move || {
        let reload = reload.clone();
        async move { Ok::<_, anyhow::Error>(plugins(reload)) }
    });

    runtime.on_startup("announce", |cx| async move {
        cx.caller("console")
            .send_message(&"console".into(), "echo-bot ready, type /help")
            .await?;
        Ok(())
    });
    runtime.on_shutdown("report", |cx| async move {
        info!(plugins = cx.plugins().len(), "echo-bot shutting down");
        Ok(())
    });

    runtime.run().await?;

    info!(stats = ?runtime.stats(), "echo-bot stopped");
    Ok(())
}
