use std::collections::BTreeMap;

use serde_json::Value;

use super::command_registry::{
    CommandSpec, ADMIN_ADD_COMMAND, MULTI_PATH_COMMANDS, NO_ARG_COMMANDS, PRESET_COMMAND,
    RAW_ARG_COMMANDS, SETTINGS_COMMANDS, SINGLE_PATH_COMMANDS, START_COMMAND, WIZARD_COMMANDS,
};

#[derive(Debug, Clone, PartialEq)]
pub struct Intent {
    pub action: String,
    pub raw: String,
    pub prompt: Option<String>,
    pub settings_update: BTreeMap<String, Value>,
    pub command_args: BTreeMap<String, Value>,
}

impl Intent {
    fn new(action: &str, raw: &str) -> Self {
        Self {
            action: action.to_string(),
            raw: raw.to_string(),
            prompt: None,
            settings_update: BTreeMap::new(),
            command_args: BTreeMap::new(),
        }
    }
}

fn find_action(command: &str, specs: &[CommandSpec]) -> Option<&'static str> {
    specs
        .iter()
        .find(|spec| spec.command == command)
        .map(|spec| spec.action)
}

fn raw_arg_key(action: &str) -> &'static str {
    match action {
        "push_mask" => "mask_id",
        "toggle_favorite" => "entry",
        "show_library" => "filter",
        _ => "arg",
    }
}

fn parse_path_args(arg: &str) -> Vec<String> {
    if arg.trim().is_empty() {
        return Vec::new();
    }
    match shell_words::split(arg) {
        Ok(parts) => parts
            .into_iter()
            .filter(|value| !value.is_empty())
            .collect(),
        Err(_) => arg
            .split_whitespace()
            .map(str::to_string)
            .filter(|value| !value.is_empty())
            .collect(),
    }
}

fn parse_single_path_arg(arg: &str) -> String {
    let parts = parse_path_args(arg);
    match parts.len() {
        0 => String::new(),
        1 => parts[0].clone(),
        _ => parts.join(" "),
    }
}

fn parse_preset_args(arg: &str) -> (String, Option<String>, Option<String>) {
    let parts = parse_path_args(arg);
    let Some(head) = parts.first() else {
        return ("list".to_string(), None, None);
    };
    let subcommand = head.to_ascii_lowercase();
    if subcommand == "rename" {
        return (subcommand, parts.get(1).cloned(), parts.get(2).cloned());
    }
    let name = if parts.len() > 1 {
        Some(parts[1..].join(" "))
    } else {
        None
    };
    (subcommand, name, None)
}

fn parse_integer_arg(value: Option<&str>) -> Value {
    value
        .and_then(|raw| raw.parse::<u64>().ok())
        .map(Value::from)
        .unwrap_or(Value::Null)
}

pub fn parse_intent(text: &str) -> Intent {
    let raw_trimmed = text.trim();
    if raw_trimmed.is_empty() {
        return Intent::new("noop", text);
    }

    if let Some(slash_tail) = raw_trimmed.strip_prefix('/') {
        let command_len = slash_tail
            .chars()
            .take_while(|ch| ch.is_ascii_alphanumeric() || *ch == '_')
            .count();
        if command_len > 0 {
            let command = slash_tail[..command_len].to_ascii_lowercase();
            let remainder = &slash_tail[command_len..];
            let arg = if remainder.is_empty() {
                ""
            } else {
                remainder.trim()
            };

            if command == START_COMMAND.command {
                let mut intent = Intent::new(START_COMMAND.action, text);
                intent.command_args.insert(
                    "referral".to_string(),
                    parse_integer_arg(arg.split_whitespace().next()),
                );
                return intent;
            }

            if let Some((_, field)) = SETTINGS_COMMANDS
                .iter()
                .find(|(name, _)| *name == command)
            {
                let mut intent = Intent::new("update_settings", text);
                intent
                    .command_args
                    .insert("field".to_string(), Value::String((*field).to_string()));
                if !arg.is_empty() {
                    let value = if arg == "-" {
                        Value::Null
                    } else {
                        Value::String(arg.to_string())
                    };
                    intent.settings_update.insert((*field).to_string(), value);
                }
                return intent;
            }

            if WIZARD_COMMANDS.iter().any(|value| *value == command) {
                let mut intent = Intent::new("start_wizard", text);
                intent
                    .command_args
                    .insert("wizard".to_string(), Value::String(command));
                return intent;
            }

            if command == PRESET_COMMAND.command {
                let (subcommand, name, target) = parse_preset_args(arg);
                let mut intent = Intent::new(PRESET_COMMAND.action, text);
                intent
                    .command_args
                    .insert("subcommand".to_string(), Value::String(subcommand));
                intent.command_args.insert(
                    "name".to_string(),
                    name.map(Value::String).unwrap_or(Value::Null),
                );
                intent.command_args.insert(
                    "target".to_string(),
                    target.map(Value::String).unwrap_or(Value::Null),
                );
                return intent;
            }

            if command == ADMIN_ADD_COMMAND.command {
                let mut parts = arg.split_whitespace();
                let mut intent = Intent::new(ADMIN_ADD_COMMAND.action, text);
                intent
                    .command_args
                    .insert("user_id".to_string(), parse_integer_arg(parts.next()));
                intent
                    .command_args
                    .insert("count".to_string(), parse_integer_arg(parts.next()));
                return intent;
            }

            if let Some(action) = find_action(&command, RAW_ARG_COMMANDS) {
                let mut intent = Intent::new(action, text);
                intent.command_args.insert(
                    raw_arg_key(action).to_string(),
                    Value::String(arg.to_string()),
                );
                return intent;
            }

            if let Some(action) = find_action(&command, SINGLE_PATH_COMMANDS) {
                let mut intent = Intent::new(action, text);
                intent.command_args.insert(
                    "path".to_string(),
                    Value::String(parse_single_path_arg(arg)),
                );
                return intent;
            }

            if let Some(action) = find_action(&command, MULTI_PATH_COMMANDS) {
                let mut intent = Intent::new(action, text);
                intent.command_args.insert(
                    "paths".to_string(),
                    Value::Array(
                        parse_path_args(arg)
                            .into_iter()
                            .map(Value::String)
                            .collect(),
                    ),
                );
                return intent;
            }

            if let Some(action) = find_action(&command, NO_ARG_COMMANDS) {
                return Intent::new(action, text);
            }

            let mut intent = Intent::new("unknown", text);
            intent
                .command_args
                .insert("command".to_string(), Value::String(command));
            intent
                .command_args
                .insert("arg".to_string(), Value::String(arg.to_string()));
            return intent;
        }
    }

    let mut intent = Intent::new("generate", text);
    intent.prompt = Some(raw_trimmed.to_string());
    intent
}
