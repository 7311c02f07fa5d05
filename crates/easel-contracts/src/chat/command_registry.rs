#[derive(Clone, Copy, Debug)]
pub(crate) struct CommandSpec {
    pub command: &'static str,
    pub action: &'static str,
}

pub(crate) const RAW_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "maskid",
        action: "push_mask",
    },
    CommandSpec {
        command: "fav",
        action: "toggle_favorite",
    },
    CommandSpec {
        command: "lib",
        action: "show_library",
    },
];

/// Session settings reachable by slash command, paired with the settings
/// key the argument patches.
pub(crate) const SETTINGS_COMMANDS: &[(&str, &str)] = &[
    ("engine", "provider"),
    ("model", "model"),
    ("format", "format"),
    ("style", "style"),
    ("negative", "negative_prompt"),
];

pub(crate) const WIZARD_COMMANDS: &[&str] = &["styletransfer", "styleguide", "sketch", "inpaint"];

pub(crate) const SINGLE_PATH_COMMANDS: &[CommandSpec] = &[CommandSpec {
    command: "editmy",
    action: "edit_image",
}];

pub(crate) const MULTI_PATH_COMMANDS: &[CommandSpec] = &[CommandSpec {
    command: "photo",
    action: "add_photos",
}];

pub(crate) const NO_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "new",
        action: "reset",
    },
    CommandSpec {
        command: "cancel",
        action: "cancel_wizard",
    },
    CommandSpec {
        command: "done",
        action: "poll_mask",
    },
    CommandSpec {
        command: "reload",
        action: "reload",
    },
    CommandSpec {
        command: "more",
        action: "more_like_this",
    },
    CommandSpec {
        command: "upscale",
        action: "upscale",
    },
    CommandSpec {
        command: "removebg",
        action: "remove_background",
    },
    CommandSpec {
        command: "variations",
        action: "variations",
    },
    CommandSpec {
        command: "profile",
        action: "profile",
    },
    CommandSpec {
        command: "buy",
        action: "buy",
    },
    CommandSpec {
        command: "help",
        action: "help",
    },
    CommandSpec {
        command: "admin_users",
        action: "admin_users",
    },
];

pub(crate) const START_COMMAND: CommandSpec = CommandSpec {
    command: "start",
    action: "start",
};

pub(crate) const PRESET_COMMAND: CommandSpec = CommandSpec {
    command: "preset",
    action: "preset",
};

pub(crate) const ADMIN_ADD_COMMAND: CommandSpec = CommandSpec {
    command: "admin_add",
    action: "admin_add",
};

pub const CHAT_HELP_COMMANDS: &[&str] = &[
    "/start",
    "/new",
    "/styletransfer",
    "/styleguide",
    "/sketch",
    "/inpaint",
    "/cancel",
    "/done",
    "/maskid",
    "/photo",
    "/editmy",
    "/engine",
    "/model",
    "/format",
    "/style",
    "/negative",
    "/preset",
    "/reload",
    "/more",
    "/upscale",
    "/removebg",
    "/variations",
    "/lib",
    "/fav",
    "/profile",
    "/buy",
    "/help",
];
