//! topicgate CLI - administer users, grants and tokens in an identity store.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use topicgate::auth::{Auther, AuthError, Manager, Permission, Role, User, EVERYONE};
use topicgate::AuthConfig;
use tracing_subscriber::EnvFilter;

/// Environment variable consulted for passwords before prompting.
const PASSWORD_ENV: &str = "TOPICGATE_PASSWORD";

#[derive(Parser)]
#[command(name = "topicgate")]
#[command(about = "Manage users and topic access for a pub/sub service")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Identity store path (overrides the config file)
    #[arg(long)]
    database: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Add, remove and inspect users
    User {
        #[command(subcommand)]
        action: UserCommand,
    },

    /// Grant, revoke and check topic access
    Access {
        #[command(subcommand)]
        action: AccessCommand,
    },

    /// Session token maintenance
    Token {
        #[command(subcommand)]
        action: TokenCommand,
    },
}

#[derive(Subcommand)]
enum UserCommand {
    /// Create a user
    Add {
        name: String,

        /// Role of the new user
        #[arg(long, value_enum, default_value = "user")]
        role: RoleArg,

        /// Password (falls back to $TOPICGATE_PASSWORD, then a prompt)
        #[arg(long)]
        password: Option<String>,
    },

    /// Delete a user with all grants and tokens
    Remove { name: String },

    /// List all users and their grants
    List,

    /// Set a new password
    ChangePass {
        name: String,

        #[arg(long)]
        password: Option<String>,
    },

    /// Change a user's role
    ChangeRole {
        name: String,

        #[arg(value_enum)]
        role: RoleArg,
    },
}

#[derive(Subcommand)]
enum AccessCommand {
    /// Grant a user (or `*` for everyone) access to a topic pattern
    Grant {
        user: String,

        /// Topic name, or a prefix ending in `*`
        topic: String,

        #[arg(value_enum)]
        level: AccessLevel,
    },

    /// Remove one grant, or all grants of a user
    Reset { user: String, topic: Option<String> },

    /// Check whether a user (or `*`) may read or write a topic
    Check {
        user: String,
        topic: String,

        #[arg(value_enum, default_value = "read")]
        permission: PermissionArg,
    },

    /// Show grants of one user, or of everybody
    List { user: Option<String> },
}

#[derive(Subcommand)]
enum TokenCommand {
    /// Delete expired tokens
    Prune,
}

#[derive(Clone, Copy, ValueEnum)]
enum RoleArg {
    User,
    Admin,
}

impl From<RoleArg> for Role {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::User => Role::User,
            RoleArg::Admin => Role::Admin,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum AccessLevel {
    #[value(name = "read-write", alias = "rw")]
    ReadWrite,
    #[value(name = "read-only", alias = "ro")]
    ReadOnly,
    #[value(name = "write-only", alias = "wo")]
    WriteOnly,
    #[value(name = "deny", alias = "none")]
    Deny,
}

impl AccessLevel {
    fn flags(self) -> (bool, bool) {
        match self {
            Self::ReadWrite => (true, true),
            Self::ReadOnly => (true, false),
            Self::WriteOnly => (false, true),
            Self::Deny => (false, false),
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum PermissionArg {
    Read,
    Write,
}

impl From<PermissionArg> for Permission {
    fn from(perm: PermissionArg) -> Self {
        match perm {
            PermissionArg::Read => Permission::Read,
            PermissionArg::Write => Permission::Write,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("topicgate=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let manager = Manager::open(&config)
        .with_context(|| format!("Failed to open identity store: {}", config.database_path.display()))?;

    let result = run(&manager, cli.command);
    manager.shutdown().context("Failed to flush pending stats")?;
    result
}

fn load_config(cli: &Cli) -> Result<AuthConfig> {
    let mut config = match &cli.config {
        Some(path) => AuthConfig::load(path)?,
        None => match AuthConfig::default_path().filter(|p| p.exists()) {
            Some(path) => AuthConfig::load(&path)?,
            None => AuthConfig::default(),
        },
    };
    if let Some(database) = &cli.database {
        config.database_path = database.clone();
    }
    Ok(config)
}

fn run(manager: &Manager, command: Commands) -> Result<()> {
    match command {
        Commands::User { action } => run_user(manager, action),
        Commands::Access { action } => run_access(manager, action),
        Commands::Token {
            action: TokenCommand::Prune,
        } => {
            let removed = manager.remove_expired_tokens()?;
            println!("removed {removed} expired token(s)");
            Ok(())
        }
    }
}

fn run_user(manager: &Manager, action: UserCommand) -> Result<()> {
    match action {
        UserCommand::Add {
            name,
            role,
            password,
        } => {
            let password = read_password(password)?;
            match manager.add_user(&name, &password, role.into()) {
                Err(AuthError::Conflict(_)) => bail!("user {name} already exists"),
                other => other?,
            }
            println!("user {name} added with role {}", Role::from(role));
        }
        UserCommand::Remove { name } => {
            manager.remove_user(&name)?;
            println!("user {name} removed");
        }
        UserCommand::List => {
            for user in manager.users()? {
                print_user(&user);
            }
        }
        UserCommand::ChangePass { name, password } => {
            let password = read_password(password)?;
            manager.change_password(&name, &password)?;
            println!("changed password for user {name}");
        }
        UserCommand::ChangeRole { name, role } => {
            manager.change_role(&name, role.into())?;
            println!("changed role for user {name} to {}", Role::from(role));
        }
    }
    Ok(())
}

fn run_access(manager: &Manager, action: AccessCommand) -> Result<()> {
    match action {
        AccessCommand::Grant { user, topic, level } => {
            let (read, write) = level.flags();
            manager.allow_access(None, &user, &topic, read, write)?;
            println!("granted {} access to topic {topic} for {}", describe(read, write), display_name(&user));
        }
        AccessCommand::Reset { user, topic } => {
            manager.reset_access(&user, topic.as_deref())?;
            match topic {
                Some(topic) => println!("reset access to topic {topic} for {}", display_name(&user)),
                None => println!("reset all access for {}", display_name(&user)),
            }
        }
        AccessCommand::Check {
            user,
            topic,
            permission,
        } => {
            let subject = if user == EVERYONE {
                None
            } else {
                Some(manager.user(&user)?)
            };
            let verdict = match manager.authorize(subject.as_ref(), &topic, permission.into()) {
                Ok(()) => "allowed",
                Err(AuthError::Unauthorized) => "denied",
                Err(e) => return Err(e.into()),
            };
            println!("{} {} on {topic}: {verdict}", display_name(&user), Permission::from(permission));
        }
        AccessCommand::List { user } => match user {
            Some(name) => print_user(&manager.user(&name)?),
            None => {
                for user in manager.users()? {
                    print_user(&user);
                }
            }
        },
    }
    Ok(())
}

fn print_user(user: &User) {
    println!("{} ({})", display_name(&user.name), user.role);
    if user.is_admin() {
        println!("- read-write access to all topics (admin role)");
        return;
    }
    if user.grants.is_empty() {
        println!("- no topic-specific permissions");
    }
    for grant in &user.grants {
        println!(
            "- {} access to topic {}",
            describe(grant.allow_read, grant.allow_write),
            grant.topic_pattern
        );
    }
}

fn describe(read: bool, write: bool) -> &'static str {
    match (read, write) {
        (true, true) => "read-write",
        (true, false) => "read-only",
        (false, true) => "write-only",
        (false, false) => "no",
    }
}

fn display_name(name: &str) -> &str {
    if name == EVERYONE {
        "everyone"
    } else {
        name
    }
}

/// Password from the flag, then the environment, then an interactive prompt.
fn read_password(flag: Option<String>) -> Result<String> {
    if let Some(password) = flag {
        return Ok(password);
    }
    if let Ok(password) = std::env::var(PASSWORD_ENV) {
        return Ok(password);
    }
    let password = dialoguer::Password::new()
        .with_prompt("Password")
        .with_confirmation("Confirm password", "Passwords do not match")
        .interact()
        .context("Failed to read password")?;
    if password.is_empty() {
        bail!("password must not be empty");
    }
    Ok(password)
}
