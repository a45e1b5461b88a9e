/*!
Command handlers for the CLI

This module provides command handlers invoked by the CLI entrypoint:

- `discover`: One-shot discovery snapshots (target list and tree)
- `rules`: Rule validation and storage management

Handlers are small and delegate to the library components.
*/

pub mod discover;
pub mod rules;
