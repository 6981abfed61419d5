use crate::calc::MarkSource;
use rusqlite::Connection;
use std::path::Path;

pub const DB_FILE_NAME: &str = "mastermarks.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            class_id TEXT,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class ON students(class_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS terms(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS academic_years(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL
        )",
        [],
    )?;

    // The three mark sources share one shape. No foreign keys: marks recorded
    // ahead of their reference rows still take part in the union.
    for table in MarkSource::ALL.map(MarkSource::table) {
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {table}(
                    student_id TEXT NOT NULL,
                    subject_id TEXT NOT NULL,
                    term_id TEXT NOT NULL,
                    academic_year_id TEXT NOT NULL,
                    total_marks REAL NOT NULL,
                    updated_at TEXT,
                    PRIMARY KEY(student_id, subject_id, term_id, academic_year_id)
                )"
            ),
            [],
        )?;
        conn.execute(
            &format!(
                "CREATE INDEX IF NOT EXISTS idx_{table}_year_term ON {table}(academic_year_id, term_id)"
            ),
            [],
        )?;
    }

    conn.execute(
        "CREATE TABLE IF NOT EXISTS weights(
            id INTEGER PRIMARY KEY CHECK (id = 1),
            mid_weight INTEGER,
            class_weight INTEGER,
            exam_weight INTEGER,
            updated_at TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS remarks(
            id TEXT PRIMARY KEY,
            min_mark REAL NOT NULL,
            max_mark REAL NOT NULL,
            grade TEXT NOT NULL,
            remark TEXT NOT NULL,
            sort_order INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;
    // Older workspaces relied on insertion order for the band scan.
    ensure_remarks_sort_order(conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_remarks_sort ON remarks(sort_order)",
        [],
    )?;

    Ok(())
}

fn ensure_remarks_sort_order(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "remarks", "sort_order")? {
        return Ok(());
    }

    conn.execute(
        "ALTER TABLE remarks ADD COLUMN sort_order INTEGER NOT NULL DEFAULT 0",
        [],
    )?;

    // Backfill from rowid so first-match-wins keeps the order bands were stored in.
    let mut stmt = conn.prepare("SELECT id FROM remarks ORDER BY rowid")?;
    let ids = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    for (i, id) in ids.iter().enumerate() {
        conn.execute(
            "UPDATE remarks SET sort_order = ? WHERE id = ?",
            (i as i64, id),
        )?;
    }

    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
