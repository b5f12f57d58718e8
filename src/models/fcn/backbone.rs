//! Backbones expose named intermediate activations to the segmentation heads.
use candle::{ModuleT, Result, Tensor};
use candle_nn::FuncT;
use std::collections::HashMap;

/// Feature maps captured during a backbone forward pass, kept in capture order.
#[derive(Debug, Clone, Default)]
pub struct FeatureMap {
    entries: Vec<(String, Tensor)>,
}

impl FeatureMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `xs` under `name`, replacing a previous entry with the same name in place.
    pub fn insert<S: Into<String>>(&mut self, name: S, xs: Tensor) {
        let name = name.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = xs,
            None => self.entries.push((name, xs)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, xs)| xs)
    }

    /// Like [`FeatureMap::get`] but missing entries are an error.
    pub fn require(&self, name: &str) -> Result<&Tensor> {
        match self.get(name) {
            Some(xs) => Ok(xs),
            None => candle::bail!(
                "backbone produced no `{name}` feature map, available: {:?}",
                self.names().collect::<Vec<_>>()
            ),
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.entries.iter().map(|(n, xs)| (n.as_str(), xs))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A feature extractor that returns named activations rather than a single tensor.
pub trait Backbone: std::fmt::Debug + Send + Sync {
    /// Names of the feature maps that [`Backbone::forward_features`] always returns.
    fn output_names(&self) -> Vec<&str>;

    fn forward_features(&self, xs: &Tensor, train: bool) -> Result<FeatureMap>;
}

/// Runs a sequence of named layers and captures the outputs of some of them.
///
/// Layers after the last capture point are dropped at construction time as their
/// outputs would never be used.
#[derive(Debug)]
pub struct IntermediateLayers {
    layers: Vec<(String, FuncT<'static>)>,
    // layer name -> output name
    return_layers: HashMap<String, String>,
    output_names: Vec<String>,
    span: tracing::Span,
}

impl IntermediateLayers {
    /// `return_layers` maps layer names to output names, e.g. `[("9", "aux"), ("12", "out")]`.
    ///
    /// Every layer name has to be present in `layers`, otherwise the capture point could
    /// never be reached and this returns an error.
    pub fn new(
        mut layers: Vec<(String, FuncT<'static>)>,
        return_layers: &[(&str, &str)],
    ) -> Result<Self> {
        if return_layers.is_empty() {
            candle::bail!("intermediate layers need at least one capture point")
        }
        for (index, (name, _)) in layers.iter().enumerate() {
            if layers[..index].iter().any(|(n, _)| n == name) {
                candle::bail!("duplicate layer name `{name}` in backbone")
            }
        }
        let mut depth = 0;
        let mut captures = HashMap::with_capacity(return_layers.len());
        for &(layer, output) in return_layers.iter() {
            let position = match layers.iter().position(|(n, _)| n == layer) {
                Some(position) => position,
                None => candle::bail!(
                    "capture layer `{layer}` for `{output}` not found in backbone with {} layers",
                    layers.len()
                ),
            };
            if captures.values().any(|o: &String| o == output) {
                candle::bail!("output `{output}` is captured more than once")
            }
            if captures.insert(layer.to_string(), output.to_string()).is_some() {
                candle::bail!("layer `{layer}` is captured more than once")
            }
            depth = usize::max(depth, position + 1);
        }
        layers.truncate(depth);
        // Outputs are listed in the order the traversal produces them.
        let output_names = layers
            .iter()
            .filter_map(|(n, _)| captures.get(n).cloned())
            .collect();
        let span = tracing::span!(tracing::Level::TRACE, "intermediate-layers");
        Ok(Self {
            layers,
            return_layers: captures,
            output_names,
            span,
        })
    }

    /// Number of layers run on each forward pass.
    pub fn depth(&self) -> usize {
        self.layers.len()
    }

    pub fn layer_names(&self) -> impl Iterator<Item = &str> {
        self.layers.iter().map(|(n, _)| n.as_str())
    }
}

impl Backbone for IntermediateLayers {
    fn output_names(&self) -> Vec<&str> {
        self.output_names.iter().map(|n| n.as_str()).collect()
    }

    fn forward_features(&self, xs: &Tensor, train: bool) -> Result<FeatureMap> {
        let _enter = self.span.enter();
        let mut features = FeatureMap::new();
        let mut xs = xs.clone();
        for (name, layer) in self.layers.iter() {
            xs = layer.forward_t(&xs, train)?;
            if let Some(output) = self.return_layers.get(name) {
                features.insert(output.as_str(), xs.clone());
            }
        }
        if features.len() != self.output_names.len() {
            candle::bail!(
                "backbone captured {:?}, expected {:?}",
                features.names().collect::<Vec<_>>(),
                self.output_names
            )
        }
        Ok(features)
    }
}
