pub mod resolver;

pub use resolver::{
    resolve, CounterpartyPreferences, EffectivePreferences, ProtocolDefaults, ResolvedPreferences,
    PREFERENCE_KEYS,
};
