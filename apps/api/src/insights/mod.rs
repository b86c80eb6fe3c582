// Insight engine: cooldown gating, fingerprinting, caching and generation.
// All writes to insight and cooldown state go through `coordinator`.
// All LLM calls go through llm_client; no direct Anthropic SDK calls here.

pub mod clock;
pub mod cooldown;
pub mod coordinator;
pub mod errors;
pub mod fingerprint;
pub mod handlers;
pub mod lock;
pub mod policy;
pub mod prompts;
pub mod providers;
pub mod store;

#[cfg(test)]
pub mod test_support;
