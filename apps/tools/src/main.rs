use anyhow::Result;
use clap::{Parser, Subcommand};
use shared::domain::ChatId;
use storage::Storage;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/chatsync.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the read marker of one chat.
    Show { chat_id: String },
    /// Print every stored read marker.
    List,
    /// Forget the read marker of one chat.
    Clear { chat_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;

    match cli.command {
        Command::Show { chat_id } => {
            match storage.load_read_position(&ChatId::new(chat_id.clone())).await? {
                Some(position) => println!(
                    "chat_id={} last_read_message_id={} last_read_time={}",
                    position.chat_id,
                    position.last_read_message_id,
                    position.last_read_time.to_rfc3339()
                ),
                None => println!("no read position for chat_id={chat_id}"),
            }
        }
        Command::List => {
            for position in storage.list_read_positions().await? {
                println!(
                    "{}\t{}\t{}",
                    position.chat_id,
                    position.last_read_message_id,
                    position.last_read_time.to_rfc3339()
                );
            }
        }
        Command::Clear { chat_id } => {
            let removed = storage.clear_read_position(&ChatId::new(chat_id.clone())).await?;
            println!("cleared chat_id={chat_id}: {removed}");
        }
    }

    Ok(())
}
