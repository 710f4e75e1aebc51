//! SQLite schema for the primary store
//!
//! Column layout matches the prompts.db files written by the desktop
//! recorder, so an existing database opens without migration.

pub const SCHEMA: &str = r#"
-- ============================================
-- PROMPTS
-- ============================================

CREATE TABLE IF NOT EXISTS prompts (
    id TEXT PRIMARY KEY,                   -- UUID, never reused
    timestamp TEXT NOT NULL,               -- RFC 3339, microsecond precision
    source TEXT NOT NULL,                  -- 'proxy', 'assistant-integration', 'rest-api'
    llm_name TEXT NOT NULL,                -- 'ChatGPT', 'Claude', ...
    model_name TEXT,                       -- empty/NULL when unknown
    prompt_text TEXT NOT NULL,
    description TEXT,
    url TEXT,
    conversation_id TEXT,
    metadata TEXT                          -- JSON object, passed through
);

CREATE INDEX IF NOT EXISTS idx_prompts_timestamp ON prompts(timestamp);
CREATE INDEX IF NOT EXISTS idx_prompts_source ON prompts(source);
CREATE INDEX IF NOT EXISTS idx_prompts_llm_name ON prompts(llm_name);
CREATE INDEX IF NOT EXISTS idx_prompts_conversation ON prompts(conversation_id);

-- ============================================
-- FILE ASSOCIATIONS
-- ============================================

CREATE TABLE IF NOT EXISTS file_associations (
    prompt_id TEXT NOT NULL,
    file_path TEXT NOT NULL,
    token_change INTEGER,                  -- net token delta in the file, if known
    PRIMARY KEY (prompt_id, file_path),
    FOREIGN KEY (prompt_id) REFERENCES prompts(id)
);

CREATE INDEX IF NOT EXISTS idx_file_associations_path ON file_associations(file_path);
"#;
