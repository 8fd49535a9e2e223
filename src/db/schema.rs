//! Database schema definitions

pub const CREATE_USERS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT NOT NULL UNIQUE,
    created_at BIGINT NOT NULL
)
"#;

// Kept apart from users so profile reads never touch the hash
pub const CREATE_CREDENTIALS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS credentials (
    user_id INTEGER PRIMARY KEY REFERENCES users(id) ON DELETE CASCADE,
    password_hash TEXT NOT NULL
)
"#;

pub const CREATE_FOLLOWS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS follows (
    follower_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    followed_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    created_at BIGINT NOT NULL,
    PRIMARY KEY (follower_id, followed_id)
)
"#;

// user_id has no foreign key: an unknown author must not fail a shared batch
pub const CREATE_POSTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS posts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    text TEXT NOT NULL,
    created_at BIGINT NOT NULL
)
"#;

// Timeline: posts by a set of authors, newest first
pub const CREATE_INDEX_POSTS_USER_CREATED: &str =
    "CREATE INDEX IF NOT EXISTS idx_posts_user_created ON posts(user_id, created_at DESC)";

// Who follows whom, looked up from the followed side
pub const CREATE_INDEX_FOLLOWS_FOLLOWED: &str =
    "CREATE INDEX IF NOT EXISTS idx_follows_followed ON follows(followed_id)";
