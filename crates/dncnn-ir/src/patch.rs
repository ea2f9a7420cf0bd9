use crate::ir::{Attribute, AttributeValue, Graph, NodeType, KERNEL_SHAPE};

/// A patched copy of a graph together with the number of repaired nodes.
#[derive(Debug, Clone, PartialEq)]
pub struct PatchOutcome {
    pub graph: Graph,
    pub patched: usize,
}

/// Add the `kernel_shape` attribute to every convolution that lacks it.
///
/// The spatial kernel is read from the trailing two dimensions of the initializer feeding the
/// convolution's weight input. The patch is additive: existing attributes and initializers are
/// copied untouched, so patching an already patched graph yields an identical graph and
/// `patched == 0`.
pub fn patch(graph: &Graph) -> PatchOutcome {
    let mut patched_graph = graph.clone();
    let mut patched = 0;

    for node in patched_graph.nodes.iter_mut() {
        if node.node_type != NodeType::Conv || node.has_attr(KERNEL_SHAPE) {
            continue;
        }

        let Some(weight_name) = node.inputs.get(1) else {
            log::warn!("Conv node '{}' has no weight input, skipping", node.name);
            continue;
        };

        let Some(weight) = graph.initializer(weight_name) else {
            log::warn!(
                "Conv node '{}': weight '{}' is not an initializer, skipping",
                node.name,
                weight_name
            );
            continue;
        };

        let rank = weight.shape.len();
        if rank < 3 {
            log::warn!(
                "Conv node '{}': weight '{}' has rank {}, skipping",
                node.name,
                weight_name,
                rank
            );
            continue;
        }

        // [out_channels, in_channels, k_h, k_w]
        let kernel: Vec<i64> = weight.shape[rank - 2..]
            .iter()
            .map(|dim| *dim as i64)
            .collect();
        log::debug!("Patching '{}' with kernel_shape {:?}", node.name, kernel);

        node.attrs.push(Attribute::new(
            KERNEL_SHAPE.to_string(),
            AttributeValue::Int64s(kernel),
        ));
        patched += 1;
    }

    PatchOutcome {
        graph: patched_graph,
        patched,
    }
}
