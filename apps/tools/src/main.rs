use anyhow::{bail, Result};
use clap::{Parser, Subcommand, ValueEnum};
use shared::domain::{ChatId, ChatKind, UserId};
use storage::Storage;

/// Operator tasks run directly against the chat database.
#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/chat.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    CreateUser {
        username: String,
        #[arg(long)]
        nickname: Option<String>,
    },
    CreateChat {
        owner_user_id: i64,
        name: String,
        #[arg(value_enum, default_value_t = KindArg::Group)]
        kind: KindArg,
        /// Additional members; a private chat takes exactly one.
        #[arg(long = "member")]
        members: Vec<i64>,
    },
    AddMember {
        chat_id: i64,
        user_id: i64,
    },
    ListChats {
        user_id: i64,
    },
    History {
        chat_id: i64,
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum KindArg {
    Private,
    Group,
    Channel,
}

impl From<KindArg> for ChatKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Private => ChatKind::Private,
            KindArg::Group => ChatKind::Group,
            KindArg::Channel => ChatKind::Channel,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;

    match cli.command {
        Command::CreateUser { username, nickname } => {
            let user_id = storage.create_user(&username, nickname.as_deref()).await?;
            println!("user_id={user_id}");
        }
        Command::CreateChat {
            owner_user_id,
            name,
            kind,
            members,
        } => {
            let owner = UserId(owner_user_id);
            let kind = ChatKind::from(kind);
            let mut others: Vec<UserId> = members
                .into_iter()
                .map(UserId)
                .filter(|member| *member != owner)
                .collect();
            others.sort();
            others.dedup();
            if kind == ChatKind::Private && others.len() != 1 {
                bail!("a private chat needs exactly one --member besides the owner");
            }
            for user_id in std::iter::once(owner).chain(others.iter().copied()) {
                if !storage.user_exists(user_id).await? {
                    bail!("user {user_id} does not exist");
                }
            }
            let chat_id = storage.create_chat(&name, kind, owner).await?;
            for member in others {
                storage.add_member(chat_id, member).await?;
            }
            println!("chat_id={chat_id}");
        }
        Command::AddMember { chat_id, user_id } => {
            let chat_id = ChatId(chat_id);
            match storage.chat_kind(chat_id).await? {
                None => bail!("chat {chat_id} does not exist"),
                Some(ChatKind::Private) => bail!("private chats cannot gain members"),
                Some(_) => {}
            }
            if !storage.user_exists(UserId(user_id)).await? {
                bail!("user {user_id} does not exist");
            }
            storage.add_member(chat_id, UserId(user_id)).await?;
            println!("added user_id={user_id} to chat_id={chat_id}");
        }
        Command::ListChats { user_id } => {
            for chat in storage.list_chats_for_user(UserId(user_id)).await? {
                println!("{}\t{:?}\t{}", chat.chat_id, chat.kind, chat.name);
            }
        }
        Command::History { chat_id, limit } => {
            for message in storage.list_chat_messages(ChatId(chat_id), 0, limit).await? {
                println!(
                    "{}\t{}\t{}\t{}",
                    message.seq_id,
                    message.created_at.to_rfc3339(),
                    message.sender_id,
                    message.content
                );
            }
        }
    }

    Ok(())
}
