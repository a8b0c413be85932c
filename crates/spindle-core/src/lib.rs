//! spindle-core
//!
//! Broker-backed background task processing: a pool of workers drains a
//! shared broker, runs each task through a pluggable executor, and records
//! the outcome in a durable record store, with bounded retry on failure.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task, envelope, retry, errors）
//! - **ports**: 抽象化レイヤー（Broker, RecordStore, Executor, Clock）
//! - **impls**: 実装（InMemory*, RedisBroker, PgRecordStore, executors）
//! - **app**: アプリケーションロジック（worker pool, retry scheduler, service）
//! - **config** / **observability**: 環境変数の読み込みとログ設定

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod observability;
pub mod ports;
