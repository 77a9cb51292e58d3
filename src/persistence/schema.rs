//! Relational schema for the Postgres mirror
//!
//! The in-memory stores are authoritative; these tables mirror them for
//! queries and recovery. Constraints restate the core invariants so a
//! divergent mirror fails loudly. Balances are only ever written by the
//! mirror paths - there are no triggers moving funds at the database
//! layer.

/// Statements executed in order by `init_schema`.
pub const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS users (
        user_id     BIGINT PRIMARY KEY,
        created_at  TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS orders (
        order_id         BIGINT PRIMARY KEY,
        user_id          BIGINT NOT NULL,
        client_order_id  TEXT,
        symbol           TEXT NOT NULL,
        side             TEXT NOT NULL,
        order_type       TEXT NOT NULL,
        status           TEXT NOT NULL,
        time_in_force    TEXT NOT NULL,
        price            NUMERIC NOT NULL CHECK (price >= 0),
        stop_price       NUMERIC,
        quantity         NUMERIC NOT NULL CHECK (quantity > 0),
        filled_quantity  NUMERIC NOT NULL DEFAULT 0
            CHECK (filled_quantity >= 0 AND filled_quantity <= quantity),
        created_at       TIMESTAMPTZ NOT NULL,
        updated_at       TIMESTAMPTZ NOT NULL,
        closed_at        TIMESTAMPTZ,
        UNIQUE (user_id, client_order_id)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_orders_symbol_status
        ON orders (symbol, status)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS trades (
        trade_id         BIGINT PRIMARY KEY,
        symbol           TEXT NOT NULL,
        maker_order_id   BIGINT NOT NULL,
        taker_order_id   BIGINT NOT NULL,
        buyer_user_id    BIGINT NOT NULL,
        seller_user_id   BIGINT NOT NULL,
        price            NUMERIC NOT NULL CHECK (price > 0),
        quantity         NUMERIC NOT NULL CHECK (quantity > 0),
        buyer_fee        NUMERIC NOT NULL DEFAULT 0,
        buyer_fee_asset  TEXT NOT NULL,
        seller_fee       NUMERIC NOT NULL DEFAULT 0,
        seller_fee_asset TEXT NOT NULL,
        taker_side       TEXT NOT NULL,
        created_at       TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_trades_symbol_created
        ON trades (symbol, created_at)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS account_balances (
        user_id         BIGINT NOT NULL,
        asset           TEXT NOT NULL,
        free_balance    NUMERIC NOT NULL DEFAULT 0 CHECK (free_balance >= 0),
        locked_balance  NUMERIC NOT NULL DEFAULT 0 CHECK (locked_balance >= 0),
        updated_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (user_id, asset)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS account_transactions (
        id          UUID PRIMARY KEY,
        user_id     BIGINT NOT NULL,
        asset       TEXT NOT NULL,
        kind        TEXT NOT NULL,
        amount      NUMERIC NOT NULL CHECK (amount > 0),
        address     TEXT,
        status      TEXT NOT NULL,
        created_at  TIMESTAMPTZ NOT NULL,
        updated_at  TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE OR REPLACE VIEW order_book_depth AS
        SELECT symbol,
               side,
               price,
               SUM(quantity - filled_quantity) AS open_quantity
        FROM orders
        WHERE status IN ('OPEN', 'PARTIALLY_FILLED')
        GROUP BY symbol, side, price
    "#,
];
