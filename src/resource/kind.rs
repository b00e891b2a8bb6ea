//! Resource kinds known to the control plane.

use std::fmt;

/// Every kind the control plane may author.
///
/// Only [`ResourceKind::is_supported`] kinds are translated into the data plane;
/// the rest are recognized so they can be skipped quietly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Route,
    Service,
    Ssl,
    PluginMetadata,
    PluginConfig,
    Consumer,
    ConsumerGroup,
    GlobalRule,
    Upstream,
    Proto,
    StreamRoute,
}

impl ResourceKind {
    /// Kinds written to the data plane.
    pub const SUPPORTED: [ResourceKind; 4] = [
        ResourceKind::Route,
        ResourceKind::Service,
        ResourceKind::Ssl,
        ResourceKind::PluginMetadata,
    ];

    /// Parse the kind segment of a control-plane key.
    pub fn from_segment(segment: &str) -> Option<Self> {
        let kind = match segment {
            "route" => ResourceKind::Route,
            "service" => ResourceKind::Service,
            "ssl" => ResourceKind::Ssl,
            "plugin_metadata" => ResourceKind::PluginMetadata,
            "plugin_config" => ResourceKind::PluginConfig,
            "consumer" => ResourceKind::Consumer,
            "consumer_group" => ResourceKind::ConsumerGroup,
            "global_rule" => ResourceKind::GlobalRule,
            "upstream" => ResourceKind::Upstream,
            "proto" => ResourceKind::Proto,
            "stream_route" => ResourceKind::StreamRoute,
            _ => return None,
        };
        Some(kind)
    }

    /// Kind segment used in control-plane keys.
    pub fn segment(self) -> &'static str {
        match self {
            ResourceKind::Route => "route",
            ResourceKind::Service => "service",
            ResourceKind::Ssl => "ssl",
            ResourceKind::PluginMetadata => "plugin_metadata",
            ResourceKind::PluginConfig => "plugin_config",
            ResourceKind::Consumer => "consumer",
            ResourceKind::ConsumerGroup => "consumer_group",
            ResourceKind::GlobalRule => "global_rule",
            ResourceKind::Upstream => "upstream",
            ResourceKind::Proto => "proto",
            ResourceKind::StreamRoute => "stream_route",
        }
    }

    /// Category directory in the data plane, for supported kinds.
    pub fn category(self) -> Option<&'static str> {
        match self {
            ResourceKind::Route => Some("routes"),
            ResourceKind::Service => Some("services"),
            ResourceKind::Ssl => Some("ssls"),
            ResourceKind::PluginMetadata => Some("plugin_metadata"),
            _ => None,
        }
    }

    /// Inverse of [`ResourceKind::category`].
    pub fn from_category(category: &str) -> Option<Self> {
        Self::SUPPORTED
            .into_iter()
            .find(|kind| kind.category() == Some(category))
    }

    pub fn is_supported(self) -> bool {
        self.category().is_some()
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.segment())
    }
}
