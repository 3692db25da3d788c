//! Reruns the build when migration files change, which `sqlx::migrate!()`
//! needs to pick up schema changes without a clean rebuild.

fn main() {
    println!("cargo:rerun-if-changed=migrations");
}
