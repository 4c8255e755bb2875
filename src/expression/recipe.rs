//! Recipe builder: flattens expression graphs into per-channel connection
//! requests.

use super::{DesiredRateExpression, ExpressionNode, WriteExpression};
use crate::cache::ChannelListener;
use crate::error::{PvError, PvResult};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;

/// Everything one channel must feed
#[derive(Clone)]
pub struct ChannelReadRecipe {
    pub channel_name: String,
    pub listeners: Vec<Arc<dyn ChannelListener>>,
}

impl ChannelReadRecipe {
    fn attach(&mut self, listener: &Arc<dyn ChannelListener>) {
        // The same cache or collector reached through several paths is fed once
        let target = Arc::as_ptr(listener) as *const ();
        if !self
            .listeners
            .iter()
            .any(|l| Arc::as_ptr(l) as *const () == target)
        {
            self.listeners.push(listener.clone());
        }
    }
}

impl fmt::Debug for ChannelReadRecipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelReadRecipe")
            .field("channel_name", &self.channel_name)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

/// Channels to connect for a set of read expressions.
///
/// A recipe is a snapshot: it is rebuilt from scratch when expressions
/// change and compared with the previous one through [`ReadRecipe::diff`].
#[derive(Clone, Debug, Default)]
pub struct ReadRecipe {
    channels: BTreeMap<String, ChannelReadRecipe>,
}

/// Outcome of comparing two recipes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecipeDiff {
    pub to_connect: Vec<String>,
    pub to_disconnect: Vec<String>,
    pub retained: Vec<String>,
}

impl RecipeDiff {
    pub fn is_empty(&self) -> bool {
        self.to_connect.is_empty() && self.to_disconnect.is_empty()
    }
}

impl ReadRecipe {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Walk the graphs once, visiting shared nodes a single time
    pub fn from_expressions<'a, I>(expressions: I) -> Self
    where
        I: IntoIterator<Item = &'a DesiredRateExpression>,
    {
        let mut channels: BTreeMap<String, ChannelReadRecipe> = BTreeMap::new();
        let mut visited = HashSet::new();
        let mut stack: Vec<&DesiredRateExpression> = expressions.into_iter().collect();
        stack.reverse();

        while let Some(expression) = stack.pop() {
            if !visited.insert(expression.id()) {
                continue;
            }
            match expression.node() {
                ExpressionNode::Leaf(subscriptions) => {
                    for subscription in subscriptions {
                        channels
                            .entry(subscription.channel.clone())
                            .or_insert_with(|| ChannelReadRecipe {
                                channel_name: subscription.channel.clone(),
                                listeners: Vec::new(),
                            })
                            .attach(&subscription.listener);
                    }
                }
                ExpressionNode::Composite(children) => {
                    stack.extend(children.iter().rev());
                }
            }
        }

        Self { channels }
    }

    /// Like [`ReadRecipe::from_expressions`], rejecting unusable channel names
    pub fn build<'a, I>(expressions: I) -> PvResult<Self>
    where
        I: IntoIterator<Item = &'a DesiredRateExpression>,
    {
        let recipe = Self::from_expressions(expressions);
        recipe.validate()?;
        Ok(recipe)
    }

    pub fn validate(&self) -> PvResult<()> {
        if self.channels.keys().any(|name| name.trim().is_empty()) {
            return Err(PvError::Configuration(
                "Expression references a channel with an empty name".to_string(),
            ));
        }
        Ok(())
    }

    pub fn channel_read_recipes(&self) -> impl Iterator<Item = &ChannelReadRecipe> {
        self.channels.values()
    }

    pub fn recipe_for(&self, channel: &str) -> Option<&ChannelReadRecipe> {
        self.channels.get(channel)
    }

    pub fn channel_names(&self) -> BTreeSet<String> {
        self.channels.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Channels to connect and disconnect to go from `previous` to `self`
    pub fn diff(&self, previous: &ReadRecipe) -> RecipeDiff {
        let mut diff = RecipeDiff::default();
        for name in self.channels.keys() {
            if previous.channels.contains_key(name) {
                diff.retained.push(name.clone());
            } else {
                diff.to_connect.push(name.clone());
            }
        }
        diff.to_disconnect = previous
            .channels
            .keys()
            .filter(|name| !self.channels.contains_key(*name))
            .cloned()
            .collect();
        diff
    }
}

/// One channel a writer delivers to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelWriteRecipe {
    pub channel_name: String,
}

#[derive(Debug, Clone, Default)]
pub struct WriteRecipe {
    channels: Vec<ChannelWriteRecipe>,
}

impl WriteRecipe {
    /// Distinct channels of a write expression, in declaration order
    pub fn build(expression: &WriteExpression) -> PvResult<Self> {
        let mut seen = HashSet::new();
        let mut channels = Vec::new();
        for name in expression.channels() {
            if name.trim().is_empty() {
                return Err(PvError::Configuration(format!(
                    "Write expression '{}' has a channel with an empty name",
                    expression.name()
                )));
            }
            if seen.insert(name.clone()) {
                channels.push(ChannelWriteRecipe {
                    channel_name: name.clone(),
                });
            }
        }
        Ok(Self { channels })
    }

    pub fn channel_write_recipes(&self) -> &[ChannelWriteRecipe] {
        &self.channels
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.channels.iter().map(|c| c.channel_name.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::*;

    #[test]
    fn test_shared_channel_appears_once() {
        let a = channel("A");
        let avg = average_of(&a);
        let both = combine(&avg, &latest_value_of(&a), "pair", |x, _| Ok(x.clone()));

        let recipe = ReadRecipe::from_expressions([&both]);
        assert_eq!(recipe.len(), 1);
        // Two distinct collectors feed from A
        assert_eq!(recipe.recipe_for("A").unwrap().listeners.len(), 2);
    }

    #[test]
    fn test_diamond_attaches_collector_once() {
        let avg = average_of(&channel("A"));
        let left = map(&avg, "l", |v| Ok(v.clone()));
        let right = map(&avg, "r", |v| Ok(v.clone()));
        let top = combine(&left, &right, "top", |x, _| Ok(x.clone()));

        let recipe = ReadRecipe::from_expressions([&top, &left]);
        assert_eq!(recipe.recipe_for("A").unwrap().listeners.len(), 1);
    }

    #[test]
    fn test_diff() {
        let a = value_of(&channel("A"));
        let b = value_of(&channel("B"));
        let c = value_of(&channel("C"));

        let old = ReadRecipe::from_expressions([&a, &b]);
        let new = ReadRecipe::from_expressions([&b, &c]);
        let diff = new.diff(&old);

        assert_eq!(diff.to_connect, vec!["C".to_string()]);
        assert_eq!(diff.to_disconnect, vec!["A".to_string()]);
        assert_eq!(diff.retained, vec!["B".to_string()]);
        assert!(new.diff(&new).is_empty());
    }

    #[test]
    fn test_empty_channel_name_is_rejected() {
        let blank = value_of(&channel(""));
        assert!(matches!(
            ReadRecipe::build([&blank]),
            Err(PvError::Configuration(_))
        ));
    }

    #[test]
    fn test_write_recipe_dedupes() {
        let expr = channels_for_write(&["A", "B", "A"]).unwrap();
        let recipe = WriteRecipe::build(&expr).unwrap();
        assert_eq!(recipe.channel_names(), vec!["A".to_string(), "B".to_string()]);
    }
}
