use std::sync::Arc;

use chrono::Utc;
use colored::Colorize;

use crate::context::CoordinationContext;
use crate::error::Result;
use crate::message::{MessageType, Recipient};
use crate::messaging::MessagingService;
use crate::output::{self, Format};
use crate::store::message_log::LogCursor;

pub fn send(
    ctx: Arc<CoordinationContext>,
    from: &str,
    to: &str,
    kind: MessageType,
    content: &str,
    ack: bool,
    format: Format,
) -> Result<()> {
    let svc = MessagingService::new(ctx)?;
    let recipient = Recipient::parse(to);
    let message = if ack {
        svc.send_with_ack(from, &recipient, kind, content)?.0
    } else {
        svc.send(from, &recipient, kind, content)?
    };
    match format {
        Format::Json => println!("{}", serde_json::to_string(&message)?),
        Format::Pretty => println!(
            "Sent to '{}': {}",
            recipient.to_string().cyan(),
            output::truncate(content, 60)
        ),
        Format::Minimal => println!("{}", message.id),
    }
    Ok(())
}

/// New messages for `agent` since its last read. With `all`, replay every
/// retained message without moving the saved cursor.
pub fn inbox(ctx: Arc<CoordinationContext>, agent: &str, all: bool, format: Format) -> Result<()> {
    let svc = MessagingService::new(ctx)?;
    let messages = if all {
        svc.inbox(agent, &LogCursor::default())?.0
    } else {
        svc.read_new(agent)?
    };
    output::print_messages(&messages, format)
}

pub fn log(ctx: Arc<CoordinationContext>, limit: usize, format: Format) -> Result<()> {
    let svc = MessagingService::new(ctx)?;
    let messages = svc.log().tail(limit)?;
    output::print_messages(&messages, format)
}

pub fn ack(
    ctx: Arc<CoordinationContext>,
    agent: &str,
    message_id: &str,
    format: Format,
) -> Result<()> {
    let svc = MessagingService::new(ctx)?;
    let ack = svc.acknowledge(agent, message_id)?;
    match format {
        Format::Json => println!("{}", serde_json::to_string(&ack)?),
        Format::Pretty => println!(
            "Acknowledged {} to '{}'",
            message_id.dimmed(),
            ack.recipient.to_string().cyan()
        ),
        Format::Minimal => println!("{}", ack.id),
    }
    Ok(())
}

/// Outstanding acknowledgements; overdue ones are expired first.
pub fn pending(ctx: Arc<CoordinationContext>, sender: Option<&str>, format: Format) -> Result<()> {
    let svc = MessagingService::new(ctx)?;
    let expired = svc.expire_acks(Utc::now())?;
    let pending = svc.pending_acks(sender)?;
    match format {
        Format::Json => println!(
            "{}",
            serde_json::json!({"pending": pending, "expired": expired})
        ),
        Format::Pretty => {
            if pending.is_empty() {
                println!("{}", "No pending acknowledgements.".dimmed());
            }
            for p in &pending {
                println!(
                    "{} {} {} {}",
                    p.message_id.dimmed(),
                    p.sender_id.cyan(),
                    "->".dimmed(),
                    p.recipient.to_string().cyan(),
                );
                println!("  {} {}", "expires:".dimmed(), p.expires_at.to_rfc3339());
            }
            if !expired.is_empty() {
                println!("{} expired", expired.len().to_string().yellow());
            }
        }
        Format::Minimal => {
            for p in &pending {
                println!("{}", p.message_id);
            }
        }
    }
    Ok(())
}

/// Check a logged message's signature. A forged message is an error.
pub fn verify(ctx: Arc<CoordinationContext>, message_id: &str, format: Format) -> Result<()> {
    let svc = MessagingService::new(ctx)?;
    let message = svc.find_message(message_id)?;
    svc.authenticate(&message)?;
    match format {
        Format::Json => println!("{}", serde_json::json!({"id": message.id, "valid": true})),
        Format::Pretty => println!("{} {}", message.id, "signature ok".green()),
        Format::Minimal => println!("ok"),
    }
    Ok(())
}
