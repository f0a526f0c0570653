//! Rebuild when migrations change.
//!
//! `sqlx::migrate!` embeds the SQL files at compile time, so edits to the
//! migrations directory must trigger a rebuild of this crate.

fn main() {
    println!("cargo:rerun-if-changed=migrations/");
}
