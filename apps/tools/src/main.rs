use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use shared::domain::SessionKey;
use storage::{CredentialRecord, Storage};

/// Operator tool for the gateway's credential store.
#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, env = "GATEWAY__DATABASE_URL", default_value = "sqlite://./data/gateway.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List every registered user.
    List,
    Show {
        key: String,
    },
    /// Delete a user's stored credentials. A running gateway picks this up on restart.
    Remove {
        key: String,
    },
    /// Forget the relay cursor so the next fetch starts from unread messages.
    ResetCursor {
        key: String,
    },
    SetToken {
        key: String,
        token: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;

    match cli.command {
        Command::List => {
            let records = storage.list_credentials().await?;
            if records.is_empty() {
                println!("no registered users");
            }
            for record in records {
                println!(
                    "{}\tusername={}\tcursor={}",
                    record.session_key, record.username, record.cursor.0
                );
            }
        }
        Command::Show { key } => {
            let key = SessionKey::new(key);
            let Some(record) = storage.load_credentials(&key).await? else {
                bail!("no credentials stored for {key}");
            };
            print_record(&record);
        }
        Command::Remove { key } => {
            let key = SessionKey::new(key);
            if !storage.delete_credentials(&key).await? {
                bail!("no credentials stored for {key}");
            }
            println!("removed {key}");
        }
        Command::ResetCursor { key } => {
            let key = SessionKey::new(key);
            if !storage.reset_cursor(&key).await? {
                bail!("no credentials stored for {key}");
            }
            println!("cursor reset for {key}");
        }
        Command::SetToken { key, token } => {
            let key = SessionKey::new(key);
            if !storage.update_token(&key, &token).await? {
                bail!("no credentials stored for {key}");
            }
            println!("token replaced for {key}");
        }
    }

    Ok(())
}

fn print_record(record: &CredentialRecord) {
    println!("session_key={}", record.session_key);
    println!("username={}", record.username);
    println!("cursor={}", record.cursor.0);
    println!("roster_initialized={}", record.roster_initialized);
    println!("updated_at={}", record.updated_at.to_rfc3339());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_kebab_case_subcommands() {
        let cli = Cli::try_parse_from([
            "tools",
            "--database-url",
            "sqlite::memory:",
            "reset-cursor",
            "alice@xmpp.test",
        ])
        .expect("parse");

        assert_eq!(cli.database_url, "sqlite::memory:");
        assert!(matches!(cli.command, Command::ResetCursor { key } if key == "alice@xmpp.test"));
    }

    #[test]
    fn set_token_requires_a_token() {
        assert!(Cli::try_parse_from(["tools", "set-token", "alice@xmpp.test"]).is_err());
    }
}
