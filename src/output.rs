use chrono::Utc;
use clap::ValueEnum;
use colored::Colorize;

use crate::error::Result;
use crate::locking::Lock;
use crate::message::{Message, Recipient};
use crate::registry::{AgentRecord, AgentStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    Json,
    Pretty,
    Minimal,
}

pub fn truncate(text: &str, max_len: usize) -> String {
    let flat = text.replace(['\n', '\r', '\t'], " ");
    if flat.chars().count() > max_len {
        let truncated: String = flat.chars().take(max_len.saturating_sub(3)).collect();
        format!("{truncated}...")
    } else {
        flat
    }
}

fn ago(seconds: u64) -> String {
    match seconds {
        s if s < 60 => format!("{s}s ago"),
        s if s < 3600 => format!("{}m ago", s / 60),
        s => format!("{}h ago", s / 3600),
    }
}

// ---------------------------------------------------------------------------
// Locks
// ---------------------------------------------------------------------------

pub fn print_lock(lock: &Lock, format: Format) -> Result<()> {
    match format {
        Format::Json => println!("{}", serde_json::to_string(lock)?),
        Format::Pretty => {
            println!(
                "{} held by {}",
                lock.resource_path.as_str().bold(),
                lock.holder_id.cyan()
            );
            if !lock.reason.is_empty() {
                println!("  {} {}", "reason:".dimmed(), lock.reason);
            }
            println!("  {} {}", "acquired:".dimmed(), lock.acquired_at.to_rfc3339());
            if let Some(refreshed) = lock.refreshed_at {
                println!("  {} {}", "refreshed:".dimmed(), refreshed.to_rfc3339());
            }
        }
        Format::Minimal => println!("{} {}", lock.resource_path, lock.holder_id),
    }
    Ok(())
}

pub fn print_locks(locks: &[Lock], stale_after: std::time::Duration, format: Format) -> Result<()> {
    match format {
        Format::Json => println!("{}", serde_json::to_string(locks)?),
        Format::Pretty => {
            if locks.is_empty() {
                println!("{}", "No locks held.".dimmed());
            }
            let now = Utc::now();
            for lock in locks {
                let age = ago(lock.age(now).as_secs());
                let line = format!(
                    "{} {} {}",
                    lock.resource_path.as_str().bold(),
                    format!("[{}]", lock.holder_id).cyan(),
                    age.dimmed()
                );
                if lock.is_stale(stale_after, now) {
                    println!("{line} {}", "stale".yellow());
                } else {
                    println!("{line}");
                }
                if !lock.reason.is_empty() {
                    println!("  {}", truncate(&lock.reason, 72).dimmed());
                }
            }
        }
        Format::Minimal => {
            for lock in locks {
                println!("{} {}", lock.resource_path, lock.holder_id);
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

fn recipient_label(recipient: &Recipient) -> String {
    match recipient {
        Recipient::Broadcast => "everyone".to_string(),
        Recipient::Agent(id) => id.clone(),
    }
}

pub fn print_message(message: &Message, format: Format) -> Result<()> {
    match format {
        Format::Json => println!("{}", serde_json::to_string(message)?),
        Format::Pretty => {
            println!(
                "{} {} {} {} {}",
                message.timestamp.format("%H:%M:%S").to_string().dimmed(),
                message.sender_id.cyan().bold(),
                "->".dimmed(),
                recipient_label(&message.recipient).cyan(),
                format!("({})", message.kind).dimmed(),
            );
            for line in message.content.lines() {
                println!("  {line}");
            }
            if message.ack_requested {
                println!("  {} {}", "ack requested:".yellow(), message.id);
            }
        }
        Format::Minimal => println!(
            "{} {} {} {}",
            message.id,
            message.sender_id,
            message.kind,
            truncate(&message.content, 60)
        ),
    }
    Ok(())
}

pub fn print_messages(messages: &[Message], format: Format) -> Result<()> {
    match format {
        Format::Json => println!("{}", serde_json::to_string(messages)?),
        Format::Pretty if messages.is_empty() => println!("{}", "No messages.".dimmed()),
        _ => {
            for message in messages {
                print_message(message, format)?;
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Agents
// ---------------------------------------------------------------------------

pub fn print_agents(agents: &[AgentRecord], format: Format) -> Result<()> {
    match format {
        Format::Json => println!("{}", serde_json::to_string(agents)?),
        Format::Pretty => {
            if agents.is_empty() {
                println!("{}", "No agents found.".dimmed());
            }
            let now = Utc::now();
            for agent in agents {
                let seen = ago((now - agent.last_seen).to_std().unwrap_or_default().as_secs());
                let status = match agent.status {
                    AgentStatus::Active => agent.status.to_string().green(),
                    AgentStatus::Gone => agent.status.to_string().red(),
                };
                println!(
                    "{} {} {} {}",
                    format!("[{}]", agent.id).cyan().bold(),
                    status,
                    format!("pane={}", agent.pane_reference).dimmed(),
                    seen.dimmed(),
                );
                if let Some(command) = &agent.command {
                    println!("  {} {}", "command:".dimmed(), command);
                }
            }
        }
        Format::Minimal => {
            for agent in agents {
                println!("{}", agent.id);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_flattens_and_shortens() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a\nb", 10), "a b");
        assert_eq!(truncate("abcdefghijkl", 8), "abcde...");
    }

    #[test]
    fn ago_buckets() {
        assert_eq!(ago(5), "5s ago");
        assert_eq!(ago(125), "2m ago");
        assert_eq!(ago(7300), "2h ago");
    }
}
