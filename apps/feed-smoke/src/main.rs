mod config;
mod logging;

use std::{sync::Arc, time::Duration};

use config::SmokeConfig;
use feed_core::{
    Conversation, ConversationKind, FeedChannelError, FeedCommand, FeedEvent, MarketRole, Message,
    Participant,
};
use feed_platform::{InMemoryMessagingApi, InMemoryRealtimeHub, message_channel_name};
use feed_runtime::{FeedRuntimeConfig, FeedRuntimeHandle, FeedSnapshot, FeedView, spawn_runtime};
use tokio::{sync::broadcast, time::timeout};
use tracing::{debug, error, info};

const RFQ_CONVERSATION: &str = "rfq-2041";
const SELLER_ID: &str = "seller-9";
const QUIET_PERIOD: Duration = Duration::from_millis(400);

#[tokio::main]
async fn main() {
    logging::init();

    let config = match SmokeConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Invalid configuration: {err}");
            std::process::exit(1);
        }
    };
    info!(user_id = %config.user_id, "starting feed smoke run");

    let hub = InMemoryRealtimeHub::default();
    let api = InMemoryMessagingApi::new(1_772_359_200_000).with_hub(hub.clone());
    seed_marketplace(&api, &config.user_id);
    api.set_response_delay(Duration::from_millis(300));

    let runtime_config =
        FeedRuntimeConfig::new(config.user_id.clone()).with_tuning(config.tuning);
    let handle = spawn_runtime(runtime_config, Arc::new(api.clone()), Arc::new(hub.clone()));
    let mut events = handle.subscribe();
    let mut view = FeedView::new(config.user_id);

    if let Err(err) = run_script(&handle, &mut events, &mut view, &api, &hub).await {
        error!(error = %err, "smoke run aborted");
        std::process::exit(1);
    }
}

async fn run_script(
    handle: &FeedRuntimeHandle,
    events: &mut broadcast::Receiver<FeedEvent>,
    view: &mut FeedView,
    api: &InMemoryMessagingApi,
    hub: &InMemoryRealtimeHub,
) -> Result<(), FeedChannelError> {
    handle
        .send(FeedCommand::ListConversations { limit: None })
        .await?;
    settle(events, view).await;
    print_snapshot("conversations", &view.snapshot());

    handle
        .send(FeedCommand::SelectConversation {
            conversation_id: RFQ_CONVERSATION.to_owned(),
        })
        .await?;
    settle(events, view).await;
    print_snapshot("selected", &view.snapshot());

    view.set_composer_text("  Can you confirm delivery by Friday?  ");
    if let Some(command) = view.submit() {
        handle.send(command).await?;
    }
    settle(events, view).await;
    print_snapshot("after send", &view.snapshot());

    let reply = api.insert_remote(
        RFQ_CONVERSATION,
        SELLER_ID,
        "Yes, Friday works. Updated quote attached.",
    );
    settle(events, view).await;
    print_snapshot("after reply", &view.snapshot());

    api.soft_delete(&reply.id);
    settle(events, view).await;
    print_snapshot("after delete", &view.snapshot());

    hub.drop_channel(&message_channel_name(RFQ_CONVERSATION));
    api.insert_remote(RFQ_CONVERSATION, SELLER_ID, "Sent while you were offline.");
    settle(events, view).await;
    print_snapshot("after channel drop", &view.snapshot());

    handle.send(FeedCommand::ClearSelection).await?;
    settle(events, view).await;
    print_snapshot("cleared", &view.snapshot());
    Ok(())
}

/// Feed events into the view until the runtime has been quiet for a while.
async fn settle(events: &mut broadcast::Receiver<FeedEvent>, view: &mut FeedView) {
    loop {
        match timeout(QUIET_PERIOD, events.recv()).await {
            Ok(Ok(event)) => {
                debug!(?event, "smoke received event");
                view.handle_event(event);
            }
            Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                debug!(skipped, "smoke event stream lagged");
            }
            Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => break,
        }
    }
    view.acknowledge_scroll();
}

fn print_snapshot(label: &str, snapshot: &FeedSnapshot) {
    println!("== {label} ==");
    println!("status: {}", snapshot.status_text);
    if let Some(error) = &snapshot.error_text {
        println!("error: {error}");
    }
    for row in &snapshot.conversations {
        let marker = if row.is_selected { '>' } else { ' ' };
        println!("{marker} {} ({})", row.title, row.conversation_id);
    }
    for row in &snapshot.messages {
        let state = if row.is_pending {
            " [sending]"
        } else if row.is_deleted {
            " [deleted]"
        } else {
            ""
        };
        println!("  {}: {}{state}", row.sender_label, row.body);
    }
    if !snapshot.composer_text.is_empty() {
        println!("composer: {}", snapshot.composer_text);
    }
}

fn seed_marketplace(api: &InMemoryMessagingApi, own_user_id: &str) {
    api.seed_conversation(Conversation {
        id: RFQ_CONVERSATION.to_owned(),
        kind: ConversationKind::Contextual,
        title: None,
        context_type: Some("rfq".to_owned()),
        context_id: Some("RFQ-2041".to_owned()),
        last_activity_ms: 1_772_359_100_000,
    });
    api.seed_conversation(Conversation {
        id: "dm-7".to_owned(),
        kind: ConversationKind::Direct,
        title: None,
        context_type: None,
        context_id: None,
        last_activity_ms: 1_772_300_000_000,
    });

    for (conversation_id, user_id, name, role) in [
        (RFQ_CONVERSATION, own_user_id, "Procurement Desk", MarketRole::Buyer),
        (RFQ_CONVERSATION, SELLER_ID, "Acme Steel Supplies", MarketRole::Seller),
        ("dm-7", own_user_id, "Procurement Desk", MarketRole::Buyer),
        ("dm-7", "gov-3", "Regional Tender Office", MarketRole::Government),
    ] {
        api.seed_participant(Participant {
            conversation_id: conversation_id.to_owned(),
            user_id: user_id.to_owned(),
            display_name: Some(name.to_owned()),
            role: Some(role),
        });
    }

    for (id, sender, body, created_at_ms) in [
        ("m1", own_user_id, "Requesting a quote for 40t of S355 beams.", 1_772_359_000_000),
        ("m2", SELLER_ID, "Quote attached: EUR 38,400 incl. delivery.", 1_772_359_100_000),
    ] {
        api.seed_message(Message {
            id: id.to_owned(),
            conversation_id: RFQ_CONVERSATION.to_owned(),
            sender_id: sender.to_owned(),
            body: Some(body.to_owned()),
            created_at_ms,
            deleted_at_ms: None,
        });
    }
}
