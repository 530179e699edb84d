//! Connects to an RTM endpoint and prints session events.
//!
//! Before running, set `RTM_URL` to a websocket URL, for example one returned
//! by your `rtm.start` call. The program sends one message after going
//! online and closes the session on Ctrl-C.

use std::error::Error;
use std::time::Duration;

use rtm_client::{ClientEvent, Message, RtmClient, RtmClientOptions};

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("rtm_client=debug")),
        )
        .init();

    let url = std::env::var("RTM_URL")
        .unwrap_or_else(|_| "wss://rtm.example.com/ws:REPLACE_WITH_TOKEN".to_string());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let options = RtmClientOptions::websocket(url).with_ping_interval(Duration::from_secs(5));
        let (client, mut events) = RtmClient::new(options)?;
        client.connect().await?;

        let mut greeted = false;
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(ClientEvent::Online) => {
                        println!("online");
                        if !greeted {
                            greeted = true;
                            let hello = Message::new("message").with_field("text", "hello");
                            match client.send(hello, Some(Duration::from_secs(3))).await {
                                Ok(reply) => println!("reply status={:?} ts={:?}", reply.status(), reply.ts()),
                                Err(err) => eprintln!("send failed: {err}"),
                            }
                        }
                    }
                    Some(ClientEvent::Offline) => println!("offline"),
                    Some(ClientEvent::Event(message)) => {
                        println!("event type={:?} fields={:?}", message.kind, message.fields);
                    }
                    Some(ClientEvent::Error(err)) => eprintln!("error: {err}"),
                    Some(ClientEvent::Close) | None => break,
                },
                _ = tokio::signal::ctrl_c() => client.close(),
            }
        }

        Ok::<(), Box<dyn Error>>(())
    })
}
