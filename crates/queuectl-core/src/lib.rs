//! queuectl-core
//!
//! Core building blocks for the queuectl job queue.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, state, job, worker, outcome, decision, errors）
//! - **ports**: 抽象化レイヤー（BackingStore, Clock, IdGenerator, CommandExecutor, ProcessLauncher）
//! - **impls**: 実装（MemoryStore, RedisStore, ShellExecutor, OsProcessLauncher）
//! - **queue**: キー配置・ジョブストア・状態遷移エンジン・バックオフ・DLQ・ワーカーレジストリ
//! - **app**: アプリケーションロジック（builder, worker_loop, scheduler_loop, manager, status）
//! - **config**: JSON 設定ファイル
//! - **observability**: tracing 初期化とステータス集計

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod queue;
