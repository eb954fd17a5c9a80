const ENQUEUE_IF_ABSENT_SCRIPT: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/scripts/ENQUEUE_IF_ABSENT.lua"
));
const MATCH_OR_NOOP_SCRIPT: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/scripts/MATCH_OR_NOOP.lua"
));
const MATCH_OR_ENQUEUE_SCRIPT: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/scripts/MATCH_OR_ENQUEUE.lua"
));
const CONTAINS_USER_SCRIPT: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/scripts/CONTAINS_USER.lua"
));
const PURGE_STALE_SCRIPT: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/scripts/PURGE_STALE.lua"
));

pub fn enqueue_if_absent_script() -> &'static str {
    ENQUEUE_IF_ABSENT_SCRIPT
}

pub fn match_or_noop_script() -> &'static str {
    MATCH_OR_NOOP_SCRIPT
}

pub fn match_or_enqueue_script() -> &'static str {
    MATCH_OR_ENQUEUE_SCRIPT
}

pub fn contains_user_script() -> &'static str {
    CONTAINS_USER_SCRIPT
}

pub fn purge_stale_script() -> &'static str {
    PURGE_STALE_SCRIPT
}
