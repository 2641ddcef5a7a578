//! DDL applied on every start; every statement is idempotent.

pub(super) const STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS products(
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        title TEXT NOT NULL,
        search_title TEXT NOT NULL,
        price INTEGER NOT NULL CHECK (price > 0),
        description TEXT NOT NULL,
        size TEXT NOT NULL,
        status TEXT NOT NULL,
        main_picture_url TEXT NOT NULL,
        picture_urls TEXT NOT NULL DEFAULT '[]',
        vk_requested BOOLEAN NOT NULL DEFAULT FALSE,
        vk_category_id INTEGER,
        vk_published BOOLEAN NOT NULL DEFAULT FALSE,
        ucoz_requested BOOLEAN NOT NULL DEFAULT FALSE,
        ucoz_published BOOLEAN NOT NULL DEFAULT FALSE,
        created_at TEXT NOT NULL
    )"#,
    r#"
    CREATE TABLE IF NOT EXISTS product_platform_ids(
        product_id INTEGER PRIMARY KEY,
        vk_external_id TEXT UNIQUE,
        vk_deleted_at TEXT,
        ucoz_external_id TEXT UNIQUE,
        ucoz_deleted_at TEXT,
        FOREIGN KEY (product_id) REFERENCES products(id) ON DELETE CASCADE
    )"#,
    r#"
    CREATE TABLE IF NOT EXISTS product_media(
        product_id INTEGER PRIMARY KEY,
        primary_media_ref TEXT NOT NULL UNIQUE,
        primary_media_url TEXT NOT NULL,
        FOREIGN KEY (product_id) REFERENCES products(id) ON DELETE CASCADE
    )"#,
    r#"
    CREATE VIRTUAL TABLE IF NOT EXISTS products_fts USING fts5(
        search_title,
        vk_published UNINDEXED,
        ucoz_published UNINDEXED
    )"#,
    r#"
    CREATE TRIGGER IF NOT EXISTS products_ai AFTER INSERT ON products BEGIN
        INSERT INTO products_fts(rowid, search_title, vk_published, ucoz_published)
        VALUES (new.id, new.search_title, new.vk_published, new.ucoz_published);
    END"#,
    r#"
    CREATE TRIGGER IF NOT EXISTS products_au AFTER UPDATE ON products BEGIN
        UPDATE products_fts SET
            search_title = new.search_title,
            vk_published = new.vk_published,
            ucoz_published = new.ucoz_published
        WHERE rowid = old.id;
    END"#,
    r#"
    CREATE TRIGGER IF NOT EXISTS products_ad AFTER DELETE ON products BEGIN
        DELETE FROM products_fts WHERE rowid = old.id;
    END"#,
];
