use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use chatsync::chatsync::conversation::{ConversationConfig, ConversationDomain};
use chatsync::chatsync::database::{Database, SqliteStorage};
use chatsync::chatsync::event_source::{ANCHOR_KEY, PENDING_KEY};
use chatsync::{
    Anchor, ChatSyncError, ChunkRef, CombinedStorage, GroupId, MessageListParams, Notifications,
    PendingMessageRecord, channel,
};

/// Prints a page of a group's message log from a chatsync SQLite store
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Path to the chatsync.sqlite file
    #[clap(long, value_name = "PATH", required = true)]
    database: PathBuf,

    /// Wallet address owning the session
    #[clap(long, required = true)]
    address: String,

    /// Group whose log is printed
    #[clap(long, required = true)]
    group: String,

    /// Number of message ids to print
    #[clap(long, default_value_t = 50)]
    size: usize,

    /// Print entries strictly before this message id
    #[clap(long)]
    until: Option<String>,

    /// Stored chunk to start in instead of the head
    #[clap(long)]
    chunk: Option<String>,

    /// Also print message bodies
    #[clap(long)]
    bodies: bool,
}

#[tokio::main]
async fn main() -> Result<(), ChatSyncError> {
    let args = Args::parse();

    let database = Database::new(args.database.clone()).await?;
    let stored_keys = database.count_keys(&format!("{}.", args.address)).await?;
    let storage = Arc::new(CombinedStorage::new(
        Arc::new(SqliteStorage::new(database)),
        args.address.as_str(),
    ));

    let anchor = storage.get_uncached::<Anchor>(ANCHOR_KEY).await?;
    let pending = storage
        .get_uncached::<Vec<PendingMessageRecord>>(PENDING_KEY)
        .await?
        .unwrap_or_default();
    println!("address:  {}", args.address);
    println!("anchor:   {}", anchor.map(|a| a.0).unwrap_or_else(|| "-".to_string()));
    println!("pending:  {}", pending.len());
    println!("keys:     {}", stored_keys);

    let (_sender, receiver) = channel();
    let conversation = ConversationDomain::new(
        ConversationConfig::default(),
        storage,
        receiver,
        Arc::new(Notifications::new()),
    );

    let page = conversation
        .get_message_list(&MessageListParams {
            group_id: GroupId::from(args.group.as_str()),
            key: args.chunk.map(ChunkRef::Stored),
            until_message_id: args.until,
            size: args.size,
            ..Default::default()
        })
        .await?;

    println!("group:    {}", args.group);
    for message_id in &page.message_ids {
        if !args.bodies {
            println!("  {message_id}");
            continue;
        }
        match conversation.get_message(message_id).await? {
            Some(message) => println!(
                "  {message_id}  [{}] {}: {}",
                message.timestamp, message.sender, message.message
            ),
            None => println!("  {message_id}  <body missing>"),
        }
    }

    match (&page.earliest_key, &page.earliest_message_id) {
        _ if page.reached_start => println!("(start of log)"),
        (Some(ChunkRef::Stored(key)), Some(earliest)) => {
            println!("older: --chunk {key} --until {earliest}")
        }
        (Some(ChunkRef::Head), Some(earliest)) => println!("older: --until {earliest}"),
        _ => {}
    }
    Ok(())
}
