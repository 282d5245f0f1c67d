use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{CommandFactory, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

mod cli_style;
mod sqlite_persistence;
mod user;

use cli_style::{get_styles, print_error, print_success};
use user::{SqliteUserStore, UserManager};

use rustyline::{
    completion::Completer,
    highlight::Highlighter,
    history::FileHistory,
    validate::Validator,
    CompletionType, Config, Editor, Helper,
};

fn parse_path(s: &str) -> Result<PathBuf> {
    let original_path = PathBuf::from(s);
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(original_path))
}

#[derive(Parser, Debug)]
#[command(styles=get_styles())]
struct CliArgs {
    /// Path to the user database (user.db).
    #[clap(value_parser = parse_path)]
    pub path: PathBuf,
}

#[derive(Parser)]
#[command(styles=get_styles(), name = "")]
struct InnerCli {
    #[command(subcommand)]
    command: InnerCommand,
}

#[derive(Subcommand)]
enum InnerCommand {
    /// Creates a user with the given handle.
    AddUser { user_handle: String },

    /// Creates a password authentication for the given user.
    /// Fails if the user already has a password set.
    AddLogin {
        user_handle: String,
        password: String,
    },

    /// Change the password of a user, fails if no password was set.
    UpdateLogin {
        user_handle: String,
        password: String,
    },

    /// Deletes the password authentication for a given user.
    DeleteLogin { user_handle: String },

    /// Shows authentication information of a given user.
    Show { user_handle: String },

    /// Verifies the password of a given user, it doesn't make any
    /// persistent change, nor does it create any token, it just
    /// compares the password hash.
    CheckPassword {
        user_handle: String,
        password: String,
    },

    /// Shows all user handles.
    UserHandles,

    /// Shows the path of the current user db.
    Where,

    /// Close this program.
    Exit,
}

enum CommandExecutionResult {
    Ok,
    Exit,
    Error(String),
}

const PROMPT: &str = ">> ";

fn format_time(time: SystemTime) -> String {
    DateTime::<Utc>::from(time)
        .format("%Y-%m-%d %H:%M:%S UTC")
        .to_string()
}

fn execute_command(
    line: String,
    user_manager: &UserManager,
    db_path: String,
) -> CommandExecutionResult {
    if line.is_empty() {
        return CommandExecutionResult::Ok;
    }

    let args =
        shlex::split(&line).unwrap_or_else(|| line.split_whitespace().map(String::from).collect());

    let cli = InnerCli::try_parse_from(std::iter::once(" ").chain(args.iter().map(String::as_str)));

    match cli {
        Ok(cli) => {
            println!("{} {}", PROMPT, &line);
            match cli.command {
                InnerCommand::AddUser { user_handle } => {
                    match user_manager.add_user(&user_handle) {
                        Ok(user_id) => {
                            print_success(&format!("Created user {} (id {})", user_handle, user_id))
                        }
                        Err(err) => return CommandExecutionResult::Error(format!("{}", err)),
                    }
                }
                InnerCommand::AddLogin {
                    user_handle,
                    password,
                } => {
                    if let Err(err) = user_manager.create_password_credentials(&user_handle, password)
                    {
                        return CommandExecutionResult::Error(format!("{}", err));
                    }
                    print_success(&format!("Password set for {}", user_handle));
                }
                InnerCommand::UpdateLogin {
                    user_handle,
                    password,
                } => {
                    if let Err(err) = user_manager.update_password_credentials(&user_handle, password)
                    {
                        return CommandExecutionResult::Error(format!("{}", err));
                    }
                    print_success(&format!("Password updated for {}", user_handle));
                }
                InnerCommand::DeleteLogin { user_handle } => {
                    if let Err(err) = user_manager.delete_password_credentials(&user_handle) {
                        return CommandExecutionResult::Error(format!("{}", err));
                    }
                    print_success(&format!("Password removed for {}", user_handle));
                }
                InnerCommand::Show { user_handle } => {
                    let user_credentials = match user_manager.get_user_credentials(&user_handle) {
                        Ok(credentials) => credentials,
                        Err(err) => return CommandExecutionResult::Error(format!("{}", err)),
                    };

                    println!("User Credentials:");
                    println!("{:#?}", user_credentials);

                    match user_manager.get_user_tokens(&user_handle) {
                        Ok(tokens) => {
                            println!("\nSession Tokens:");
                            if tokens.is_empty() {
                                println!("  (no active sessions)");
                            }
                            for token in tokens.iter() {
                                let last_used = token
                                    .last_used
                                    .map(format_time)
                                    .unwrap_or_else(|| "never".to_string());
                                println!(
                                    "  - {}… created {}, last used {}",
                                    &token.value.0[..8],
                                    format_time(token.created),
                                    last_used
                                );
                            }
                        }
                        Err(err) => return CommandExecutionResult::Error(format!("{}", err)),
                    }
                }
                InnerCommand::UserHandles => match user_manager.get_all_user_handles() {
                    Ok(handles) => println!("{:#?}", handles),
                    Err(err) => return CommandExecutionResult::Error(format!("{}", err)),
                },
                InnerCommand::Where => {
                    println!("{}", db_path);
                }
                InnerCommand::CheckPassword {
                    user_handle,
                    password,
                } => {
                    let user_credentials = match user_manager.get_user_credentials(&user_handle) {
                        Ok(Some(x)) => x,
                        Ok(None) => {
                            return CommandExecutionResult::Error(format!(
                                "User {} not found.",
                                user_handle
                            ));
                        }
                        Err(err) => return CommandExecutionResult::Error(format!("{}", err)),
                    };
                    let password_credentials = match user_credentials.username_password {
                        Some(x) => x,
                        None => {
                            return CommandExecutionResult::Error(format!(
                                "User {} has no password set.",
                                user_handle
                            ));
                        }
                    };
                    let msg = match password_credentials.hasher.verify(
                        password,
                        password_credentials.hash,
                        password_credentials.salt,
                    ) {
                        Ok(true) => "The password provided is correct!",
                        Ok(false) => "Wrong password.",
                        Err(err) => &format!(
                            "Could not verify the password, something went wrong: {}",
                            err
                        ),
                    };
                    println!("{}", msg);
                }
                InnerCommand::Exit => return CommandExecutionResult::Exit,
            }
        }

        Err(e) => {
            if e.print().is_err() {
                println!("{}", e);
            }
        }
    }
    CommandExecutionResult::Ok
}

#[derive(rustyline_derive::Hinter)]
struct MyHelper {
    commands_names: Vec<String>,
}

impl MyHelper {
    pub fn new() -> Self {
        let commands_names: Vec<String> = InnerCli::command()
            .get_subcommands()
            .map(|sc| sc.get_name().to_string())
            .collect();

        MyHelper { commands_names }
    }
}

impl Completer for MyHelper {
    type Candidate = String;

    fn complete(
        &self,
        line: &str,
        _pos: usize,
        _ctx: &rustyline::Context<'_>,
    ) -> rustyline::Result<(usize, Vec<String>)> {
        if line.contains(" ") {
            return Ok((0, Vec::with_capacity(0)));
        }
        let matches = self
            .commands_names
            .iter()
            .filter(|c| c.starts_with(line))
            .map(|c| c.to_string())
            .collect::<Vec<_>>();

        Ok((0, matches))
    }
}

impl Highlighter for MyHelper {}
impl Validator for MyHelper {}
impl Helper for MyHelper {}

fn main() -> Result<()> {
    let cli_args = CliArgs::parse();
    let user_db_path = cli_args.path;
    let user_store = SqliteUserStore::new(&user_db_path)
        .with_context(|| format!("Could not open user db at {:?}", user_db_path))?;
    let user_manager = UserManager::new(Arc::new(user_store));

    InnerCli::command().print_long_help()?;

    let config = Config::builder()
        .completion_type(CompletionType::List)
        .build();

    let mut rl = Editor::<MyHelper, FileHistory>::with_config(config)?;

    let helper = MyHelper::new();
    rl.set_helper(Some(helper));
    let _ = rl.clear_screen();

    loop {
        let readline = rl.readline(PROMPT);

        let _ = rl.clear_screen();
        match readline {
            Ok(line) => {
                let _ = rl.add_history_entry(&line);
                match execute_command(
                    line,
                    &user_manager,
                    user_db_path.display().to_string(),
                ) {
                    CommandExecutionResult::Ok => {}
                    CommandExecutionResult::Exit => {
                        break;
                    }
                    CommandExecutionResult::Error(err) => {
                        print_error(&err);
                        continue;
                    }
                }
            }
            Err(rustyline::error::ReadlineError::Interrupted) => {
                println!("CTRL-C");
                break;
            }
            Err(rustyline::error::ReadlineError::Eof) => {
                println!("CTRL-D: exiting.");
                break;
            }
            Err(e) => {
                println!("Error: {:?}", e);
                break;
            }
        }
    }
    Ok(())
}
