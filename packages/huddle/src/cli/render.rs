//! Terminal output for the message view and session status.

use tokio::sync::watch;

use huddle::{ChatMessage, ConnectionState, MessageType, SessionStatus};

fn line(message: &ChatMessage) -> String {
    let time = message.timestamp.format("%H:%M");
    match message.kind {
        MessageType::Join | MessageType::Leave => format!("{time} * {}", message.content),
        MessageType::Chat | MessageType::History => {
            format!("{time} <{}> {}", message.sender, message.content)
        }
    }
}

/// How to bring the screen from `shown` to `next`: append the new tail, or
/// redraw everything when the view was replaced.
fn update<'a>(shown: &[ChatMessage], next: &'a [ChatMessage]) -> (bool, &'a [ChatMessage]) {
    if next.len() >= shown.len() && next[..shown.len()] == *shown {
        (false, &next[shown.len()..])
    } else {
        (true, next)
    }
}

pub async fn messages(mut rx: watch::Receiver<Vec<ChatMessage>>) {
    let mut shown: Vec<ChatMessage> = Vec::new();
    while rx.changed().await.is_ok() {
        let next = rx.borrow_and_update().clone();
        let (redraw, tail) = update(&shown, &next);
        if redraw {
            println!("── {} messages ──", next.len());
        }
        for message in tail {
            println!("{}", line(message));
        }
        shown = next;
    }
}

pub fn describe(status: &SessionStatus) -> String {
    let mut out = format!("[{} as {}", status.state.label(), status.username.as_deref().unwrap_or("-"));
    out.push_str(&format!(" in #{}", status.channel));
    match status.state {
        ConnectionState::Reconnecting { attempt } => out.push_str(&format!(", retry {attempt}")),
        ConnectionState::Disconnected if status.exhausted => {
            out.push_str(&format!(", gave up after {} attempts", status.reconnect_attempts))
        }
        _ => {}
    }
    if let Some(err) = &status.last_error {
        out.push_str(&format!(", last error: {err}"));
    }
    out.push(']');
    out
}

pub async fn status(mut rx: watch::Receiver<SessionStatus>) {
    let mut last = rx.borrow().state;
    while rx.changed().await.is_ok() {
        let status = rx.borrow_and_update().clone();
        if status.state != last {
            eprintln!("{}", describe(&status));
            last = status.state;
        }
    }
}
