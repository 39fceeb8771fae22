//! Mend — issue-resolution pipeline.
//!
//! ## Overview
//!
//! A submitted bug report becomes an issue record and is driven through
//! triage, sandboxed automated remediation, pull-request submission and
//! notification by a per-issue asynchronous run. The caller gets its
//! response as soon as the record exists; everything else happens in the
//! background and is observable by polling the store.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌─────────────────────────────────────────────────┐
//! │  Client  │ ───────> │  server.rs  (axum Router, ServerConfig)         │
//! │          │ <─────── │    └─ api.rs  (route handlers, AppState)        │
//! └──────────┘          │         │                                       │
//!                       │         │ Orchestrator::submit()                │
//!                       │         v                                       │
//!                       │  orchestrator.rs  (state machine, ActiveRuns)   │
//!                       │     │        │                                  │
//!                       │     │        │ Classifier::classify()           │
//!                       │     │        v                                  │
//!                       │     │   classifier.rs ── llm.rs (Claude client) │
//!                       │     │                                           │
//!                       │     │ SandboxProvider::create()                 │
//!                       │     v                                           │
//!                       │  sandbox.rs   (HostSandbox, bounded lifetime)   │
//!                       │     │                                           │
//!                       │     │ CodeFixAgent::run()                       │
//!                       │     v                                           │
//!                       │  agent.rs     (five-step fix loop, FixModel)    │
//!                       │     │                                           │
//!                       │     │ CodeHost::submit_fix() / Notifier         │
//!                       │     v                                           │
//!                       │  hosting.rs (GitHub PRs)   notify.rs (alerts)   │
//!                       └─────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module       | Responsibility                                        |
//! |--------------|-------------------------------------------------------|
//! | `models`     | Shared types: `Issue`, `IssueStatus`, `AgentResult`   |
//! | `store`      | `IssueStore` trait + in-memory implementation         |
//! | `llm`        | Minimal Anthropic Messages client                     |
//!
//! ## Typical Request Flow (submit an issue)
//!
//! 1. `POST /api/issues/report` → `api::report_issue()` validates input.
//! 2. `Orchestrator::submit()` saves the record (`received`), registers
//!    the issue in `ActiveRuns`, spawns the detached run and returns.
//! 3. The run advances the record through the state machine, owning one
//!    sandbox for the automated path and destroying it on every exit.
//! 4. Polling clients read progress from the store at any time via
//!    `GET /api/issues/{id}` and the dashboard projections.

pub mod agent;
pub mod classifier;
pub mod hosting;
pub mod llm;
pub mod models;
pub mod notify;
pub mod orchestrator;
pub mod sandbox;
pub mod store;
