use snafu::{Snafu, ensure};

use crate::chat::ChatRef;

/// One line of terminal input mapped onto a client operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    SetName(String),
    Create(String),
    Select(ChatRef),
    Rename(ChatRef, String),
    Delete(ChatRef),
    Send(String),
    Logout,
    Copilot(bool),
    List,
    Help,
    Quit,
}

#[derive(Debug, Snafu, PartialEq, Eq)]
#[snafu(visibility(pub(crate)))]
pub enum CommandError {
    #[snafu(display("nothing to do"))]
    EmptyLine { stage: &'static str },
    #[snafu(display("unknown command `/{command}`, try /help"))]
    UnknownCommand {
        stage: &'static str,
        command: String,
    },
    #[snafu(display("`/{command}` needs {argument}"))]
    MissingArgument {
        stage: &'static str,
        command: &'static str,
        argument: &'static str,
    },
}

pub const HELP: &str = "\
commands:
  /name <display name>     sign in
  /new <name>              create a conversation and open it
  /open <n|id>             open a conversation
  /rename <n|id> <name>    rename a conversation
  /delete <n|id>           delete a conversation
  /copilot <on|off>        answer @copilot mentions, saved to settings
  /list                    redraw the screen
  /logout                  forget the display name
  /quit                    exit
anything else is sent to the open conversation; mention @copilot for help";

/// Lines starting with `/` are commands; `//` escapes a message that starts with a slash.
pub fn parse_command(line: &str) -> Result<Command, CommandError> {
    let line = line.trim();
    ensure!(
        !line.is_empty(),
        EmptyLineSnafu {
            stage: "parse-command",
        }
    );

    let Some(body) = line.strip_prefix('/') else {
        return Ok(Command::Send(line.to_string()));
    };
    if body.starts_with('/') {
        return Ok(Command::Send(body.to_string()));
    }

    let (keyword, rest) = match body.split_once(char::is_whitespace) {
        Some((keyword, rest)) => (keyword, rest.trim()),
        None => (body, ""),
    };

    match keyword.to_ascii_lowercase().as_str() {
        "name" | "login" => Ok(Command::SetName(required(rest, "name", "a display name")?)),
        "new" | "create" => Ok(Command::Create(required(rest, "new", "a conversation name")?)),
        "open" | "select" => Ok(Command::Select(parse_chat_ref(&required(
            rest,
            "open",
            "a conversation number or id",
        )?))),
        "rename" => {
            let (target, name) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
            let target = required(target, "rename", "a conversation number or id")?;
            let name = required(name, "rename", "a new name")?;
            Ok(Command::Rename(parse_chat_ref(&target), name))
        }
        "delete" | "rm" => Ok(Command::Delete(parse_chat_ref(&required(
            rest,
            "delete",
            "a conversation number or id",
        )?))),
        "logout" => Ok(Command::Logout),
        "copilot" => {
            let switch = required(rest, "copilot", "on or off")?;
            match switch.to_ascii_lowercase().as_str() {
                "on" => Ok(Command::Copilot(true)),
                "off" => Ok(Command::Copilot(false)),
                _ => MissingArgumentSnafu {
                    stage: "parse-command-argument",
                    command: "copilot",
                    argument: "on or off",
                }
                .fail(),
            }
        }
        "list" | "ls" => Ok(Command::List),
        "help" | "?" => Ok(Command::Help),
        "quit" | "exit" | "q" => Ok(Command::Quit),
        other => UnknownCommandSnafu {
            stage: "parse-command",
            command: other.to_string(),
        }
        .fail(),
    }
}

pub fn parse_chat_ref(raw: &str) -> ChatRef {
    let raw = raw.trim().trim_start_matches('#');
    match raw.parse::<usize>() {
        Ok(position) => ChatRef::Position(position),
        Err(_) => ChatRef::Id(raw.to_string()),
    }
}

fn required(
    raw: &str,
    command: &'static str,
    argument: &'static str,
) -> Result<String, CommandError> {
    let value = raw.trim();
    ensure!(
        !value.is_empty(),
        MissingArgumentSnafu {
            stage: "parse-command-argument",
            command,
            argument,
        }
    );
    Ok(value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_a_message() {
        assert_eq!(
            parse_command("  hello there "),
            Ok(Command::Send("hello there".to_string()))
        );
        assert_eq!(
            parse_command("//shrug"),
            Ok(Command::Send("/shrug".to_string()))
        );
    }

    #[test]
    fn commands_with_arguments() {
        assert_eq!(
            parse_command("/new  Team chat"),
            Ok(Command::Create("Team chat".to_string()))
        );
        assert_eq!(
            parse_command("/open 2"),
            Ok(Command::Select(ChatRef::Position(2)))
        );
        assert_eq!(
            parse_command("/rename #1 Weekend plans"),
            Ok(Command::Rename(
                ChatRef::Position(1),
                "Weekend plans".to_string()
            ))
        );
        assert_eq!(
            parse_command("/delete 0194f3c2-7a1b-7c3d-9e8f-0123456789ab"),
            Ok(Command::Delete(ChatRef::Id(
                "0194f3c2-7a1b-7c3d-9e8f-0123456789ab".to_string()
            )))
        );
        assert_eq!(
            parse_command("/NAME alice"),
            Ok(Command::SetName("alice".to_string()))
        );
    }

    #[test]
    fn bare_commands() {
        assert_eq!(parse_command("/logout"), Ok(Command::Logout));
        assert_eq!(parse_command("/copilot ON"), Ok(Command::Copilot(true)));
        assert_eq!(parse_command("/copilot off"), Ok(Command::Copilot(false)));
        assert_eq!(parse_command("/list"), Ok(Command::List));
        assert_eq!(parse_command("/help"), Ok(Command::Help));
        assert_eq!(parse_command("/q"), Ok(Command::Quit));
    }

    #[test]
    fn rejects_blank_unknown_and_incomplete_input() {
        assert!(matches!(
            parse_command("   "),
            Err(CommandError::EmptyLine { .. })
        ));
        assert!(matches!(
            parse_command("/dance"),
            Err(CommandError::UnknownCommand { command, .. }) if command == "dance"
        ));
        assert!(matches!(
            parse_command("/new   "),
            Err(CommandError::MissingArgument { command: "new", .. })
        ));
        assert!(matches!(
            parse_command("/copilot maybe"),
            Err(CommandError::MissingArgument { command: "copilot", .. })
        ));
        assert!(matches!(
            parse_command("/rename 1"),
            Err(CommandError::MissingArgument {
                argument: "a new name",
                ..
            })
        ));
    }
}
