use std::collections::HashMap;

/// Decision details handed to [`IntegrationCallback::execute`].
///
/// Keys are camelCase: `featureName`, `featureId`, `featureKey`, `userId`, `api`,
/// `customVariables`, `variationTargetingVariables`, and the rollout/experiment ids, keys and
/// variation ids of the rules the user passed.
pub type Decision = HashMap<String, serde_json::Value>;

/// A hook invoked with every flag decision and tracked event, e.g. to forward them to an
/// analytics tool.
///
/// Implemented for any `Fn(&Decision)`:
///
/// ```
/// # use vwo_fme::ClientConfig;
/// let config = ClientConfig::new("sdk-key", 123456).integrations(|decision: &vwo_fme::Decision| {
///     println!("{:?}", decision);
/// });
/// ```
pub trait IntegrationCallback {
    /// Receive a decision.
    fn execute(&self, decision: &Decision);
}

pub(crate) struct NoopIntegrationCallback;
impl IntegrationCallback for NoopIntegrationCallback {
    fn execute(&self, _decision: &Decision) {}
}

impl<T: Fn(&Decision)> IntegrationCallback for T {
    fn execute(&self, decision: &Decision) {
        self(decision);
    }
}
