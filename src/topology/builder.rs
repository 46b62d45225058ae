//! Topology resolution: registry + configuration → concrete stage graph.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::config::Config;
use crate::error::PipelineError;
use crate::topology::{ChannelKind, ChannelRole, OutputPort, Scope, StageDef, StageRegistry};

/// A stage retained by the builder, with its ports already evaluated
/// against the configuration.
#[derive(Debug, Clone)]
pub struct ActiveStage {
    pub def: Arc<StageDef>,
    pub inputs: Vec<ChannelRole>,
    pub outputs: Vec<OutputPort>,
}

impl ActiveStage {
    pub fn id(&self) -> &'static str {
        self.def.id
    }

    pub fn scope(&self) -> Scope {
        self.def.scope
    }

    /// Number of instances this stage has for `num_samples` samples.
    pub fn instance_count(&self, num_samples: usize) -> usize {
        match self.def.scope {
            Scope::PerSample => num_samples,
            Scope::Global => 1,
        }
    }
}

/// Binding of one channel role: who writes it and who reads it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Edge {
    pub role: ChannelRole,
    pub kind: ChannelKind,
    pub producers: Vec<&'static str>,
    pub consumers: Vec<&'static str>,
}

/// The concrete, acyclic stage graph for one run.
#[derive(Debug, Clone)]
pub struct Topology {
    /// Active stages in dependency order
    stages: Vec<ActiveStage>,
    edges: BTreeMap<ChannelRole, Edge>,
    index: HashMap<&'static str, usize>,
}

impl Topology {
    /// Resolve `registry` against `config`.
    ///
    /// Fails with [`PipelineError::UnresolvedChannel`] when an input has no
    /// producer (or more than one, for routed roles) and with
    /// [`PipelineError::TopologyCycle`] when the active stages cannot be
    /// ordered.
    pub fn build(registry: &StageRegistry, config: &Config) -> Result<Self, PipelineError> {
        let mut active: Vec<ActiveStage> = Vec::new();
        let mut seen = BTreeSet::new();
        for def in registry.stages().iter().filter(|s| s.is_active(config)) {
            if !seen.insert(def.id) {
                return Err(PipelineError::DuplicateStage {
                    stage: def.id.to_string(),
                });
            }
            let mut inputs: Vec<ChannelRole> = Vec::new();
            for port in def.active_inputs(config) {
                if !inputs.contains(&port.role) {
                    inputs.push(port.role);
                }
            }
            let outputs: Vec<OutputPort> = def.active_outputs(config).copied().collect();
            active.push(ActiveStage {
                def: Arc::clone(def),
                inputs,
                outputs,
            });
        }

        // role -> producing stage positions (registry order)
        let mut producers: BTreeMap<ChannelRole, Vec<usize>> = BTreeMap::new();
        for (idx, stage) in active.iter().enumerate() {
            for port in &stage.outputs {
                let entry = producers.entry(port.role).or_default();
                if !entry.contains(&idx) {
                    entry.push(idx);
                }
            }
        }

        let mut edges: BTreeMap<ChannelRole, Edge> = producers
            .iter()
            .map(|(role, idxs)| {
                let edge = Edge {
                    role: *role,
                    kind: role.kind(),
                    producers: idxs.iter().map(|&i| active[i].id()).collect(),
                    consumers: Vec::new(),
                };
                (*role, edge)
            })
            .collect();

        // consumer position -> producer positions it waits on
        let mut depends_on: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); active.len()];

        for (idx, stage) in active.iter().enumerate() {
            for &role in &stage.inputs {
                let unresolved = |reason: String| PipelineError::UnresolvedChannel {
                    stage: stage.id().to_string(),
                    role,
                    reason,
                };

                let found = producers.get(&role).map(Vec::as_slice).unwrap_or(&[]);
                match (role.kind(), found.len()) {
                    (_, 0) => return Err(unresolved("no active producer".into())),
                    (ChannelKind::Routed, n) if n > 1 => {
                        let ids: Vec<_> = found.iter().map(|&i| active[i].id()).collect();
                        return Err(unresolved(format!(
                            "ambiguous producers: {}",
                            ids.join(", ")
                        )));
                    }
                    _ => {}
                }
                if found.contains(&idx) {
                    return Err(unresolved("stage consumes its own output".into()));
                }

                match role.kind() {
                    ChannelKind::Routed => {
                        let producer = &active[found[0]];
                        if stage.scope() == Scope::Global && producer.scope() == Scope::PerSample {
                            return Err(unresolved(format!(
                                "global stage cannot read per-sample channel from '{}'",
                                producer.id()
                            )));
                        }
                    }
                    ChannelKind::Collecting => {
                        if stage.scope() != Scope::Global {
                            return Err(unresolved(
                                "collecting channels feed global stages only".into(),
                            ));
                        }
                    }
                }

                if let Some(edge) = edges.get_mut(&role) {
                    if role.kind() == ChannelKind::Collecting && !edge.consumers.is_empty() {
                        return Err(unresolved(format!(
                            "collecting channel already consumed by '{}'",
                            edge.consumers[0]
                        )));
                    }
                    edge.consumers.push(stage.id());
                }
                depends_on[idx].extend(found.iter().copied());
            }
        }

        let order = topological_order(&active, &depends_on)?;
        let mut slots: Vec<Option<ActiveStage>> = active.into_iter().map(Some).collect();
        let stages: Vec<ActiveStage> = order
            .into_iter()
            .filter_map(|i| slots[i].take())
            .collect();
        let index = stages
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id(), i))
            .collect();

        tracing::debug!(
            "Topology resolved: {} active stages, {} channel roles",
            stages.len(),
            edges.len()
        );

        Ok(Self {
            stages,
            edges,
            index,
        })
    }

    /// Active stages in dependency order.
    pub fn stages(&self) -> &[ActiveStage] {
        &self.stages
    }

    pub fn stage_ids(&self) -> Vec<&'static str> {
        self.stages.iter().map(ActiveStage::id).collect()
    }

    pub fn stage(&self, id: &str) -> Option<&ActiveStage> {
        self.index.get(id).map(|&i| &self.stages[i])
    }

    /// Position of a stage in dependency order.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn edges(&self) -> &BTreeMap<ChannelRole, Edge> {
        &self.edges
    }

    pub fn edge(&self, role: ChannelRole) -> Option<&Edge> {
        self.edges.get(&role)
    }

    /// Scope of the stage producing a routed role.
    pub fn producer_scope(&self, role: ChannelRole) -> Option<Scope> {
        let edge = self.edges.get(&role)?;
        let producer = edge.producers.first()?;
        self.stage(producer).map(ActiveStage::scope)
    }

    /// Expected item count of a collecting channel: one item per
    /// (active producer stage, instance). Disabled branches contribute zero.
    pub fn expected_count(&self, role: ChannelRole, num_samples: usize) -> usize {
        self.edges.get(&role).map_or(0, |edge| {
            edge.producers
                .iter()
                .filter_map(|id| self.stage(id))
                .map(|s| s.instance_count(num_samples))
                .sum()
        })
    }

    /// Total instances over all active stages.
    pub fn instance_count(&self, num_samples: usize) -> usize {
        self.stages
            .iter()
            .map(|s| s.instance_count(num_samples))
            .sum()
    }

    /// Graphviz rendering of the stage graph. Collecting edges are dashed.
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph pipeline {\n  rankdir=LR;\n");
        for stage in &self.stages {
            let shape = match stage.scope() {
                Scope::PerSample => "box",
                Scope::Global => "doubleoctagon",
            };
            out.push_str(&format!("  \"{}\" [shape={}];\n", stage.id(), shape));
        }
        for edge in self.edges.values() {
            let style = match edge.kind {
                ChannelKind::Routed => "solid",
                ChannelKind::Collecting => "dashed",
            };
            for producer in &edge.producers {
                for consumer in &edge.consumers {
                    out.push_str(&format!(
                        "  \"{}\" -> \"{}\" [label=\"{}\", style={}];\n",
                        producer, consumer, edge.role, style
                    ));
                }
            }
        }
        out.push_str("}\n");
        out
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Stages ({}):", self.stages.len())?;
        for stage in &self.stages {
            let inputs: Vec<_> = stage.inputs.iter().map(|r| r.as_str()).collect();
            let outputs: Vec<_> = stage.outputs.iter().map(|p| p.role.as_str()).collect();
            writeln!(
                f,
                "  {:<18} {:<10} cpus={:<2} [{}] -> [{}]",
                stage.id(),
                match stage.scope() {
                    Scope::PerSample => "per-sample",
                    Scope::Global => "global",
                },
                stage.def.cpus,
                inputs.join(", "),
                outputs.join(", ")
            )?;
        }
        writeln!(f, "Channels ({}):", self.edges.len())?;
        for edge in self.edges.values() {
            writeln!(
                f,
                "  {:<18} {:<10} {} -> {}",
                edge.role.as_str(),
                match edge.kind {
                    ChannelKind::Routed => "routed",
                    ChannelKind::Collecting => "collecting",
                },
                edge.producers.join(", "),
                if edge.consumers.is_empty() {
                    "(published)".to_string()
                } else {
                    edge.consumers.join(", ")
                }
            )?;
        }
        Ok(())
    }
}

/// Kahn's algorithm; ties are broken by registry order so the result is
/// deterministic for a given configuration.
fn topological_order(
    stages: &[ActiveStage],
    depends_on: &[BTreeSet<usize>],
) -> Result<Vec<usize>, PipelineError> {
    let mut in_degree: Vec<usize> = depends_on.iter().map(BTreeSet::len).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); stages.len()];
    for (consumer, deps) in depends_on.iter().enumerate() {
        for &producer in deps {
            dependents[producer].push(consumer);
        }
    }

    let mut ready: BTreeSet<usize> = (0..stages.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(stages.len());
    while let Some(next) = ready.pop_first() {
        order.push(next);
        for &dependent in &dependents[next] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }

    if order.len() != stages.len() {
        let stuck = (0..stages.len())
            .filter(|&i| in_degree[i] > 0)
            .map(|i| stages[i].id().to_string())
            .collect();
        return Err(PipelineError::TopologyCycle { stages: stuck });
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;
    use crate::topology::{always, StageDef};

    fn config(mode: &str, control: bool, aligner: &str) -> Config {
        let control = if control {
            "  control: \"ctrl/*_R{1,2}.fastq.gz\"\n"
        } else {
            ""
        };
        let yaml = format!(
            "input:\n  reads: \"data/*_R{{1,2}}.fastq.gz\"\n{control}mode: {mode}\naligner: {aligner}\n\
             databases:\n  human_index: /db/hg38\n  kraken2_db: /db/k2\n  centrifuge_db: /db/cf\n"
        );
        Config::resolve(Options::from_yaml(&yaml).unwrap()).unwrap()
    }

    fn build(config: &Config) -> Topology {
        Topology::build(&StageRegistry::standard(), config).unwrap()
    }

    #[test]
    fn test_ancient_no_control_kraken2() {
        let topology = build(&config("ancient", false, "kraken2"));
        let ids = topology.stage_ids();

        for absent in ["control_reads", "index_control", "align_control", "centrifuge", "centrifuge_filter"] {
            assert!(!ids.contains(&absent), "{absent} should be inactive");
        }
        for present in ["reads", "fastqc", "trim", "align_human", "damage_profile", "kraken2", "kraken2_filter", "multiqc", "taxonomy_report"] {
            assert!(ids.contains(&present), "{present} should be active");
        }

        assert_eq!(topology.expected_count(ChannelRole::Taxonomy, 2), 2);
        assert_eq!(topology.expected_count(ChannelRole::AlignmentMetrics, 2), 2);
        assert_eq!(topology.expected_count(ChannelRole::DamageProfile, 2), 2);
        assert_eq!(
            topology.edge(ChannelRole::CleanReads).unwrap().producers,
            vec!["align_human"]
        );
    }

    #[test]
    fn test_modern_control_centrifuge() {
        let topology = build(&config("modern", true, "centrifuge"));
        let ids = topology.stage_ids();

        assert!(ids.contains(&"index_control"));
        assert!(ids.contains(&"align_control"));
        assert!(!ids.contains(&"damage_profile"));
        assert!(!ids.contains(&"kraken2"));

        let metrics = topology.edge(ChannelRole::AlignmentMetrics).unwrap();
        assert_eq!(metrics.producers, vec!["align_human", "align_control"]);
        assert_eq!(metrics.consumers, vec!["multiqc"]);
        assert_eq!(topology.expected_count(ChannelRole::AlignmentMetrics, 3), 6);

        // Control rewires the classifier input without duplicating it.
        assert_eq!(
            topology.edge(ChannelRole::CleanReads).unwrap().producers,
            vec!["align_control"]
        );
        assert_eq!(
            topology.edge(ChannelRole::HostUnmapped).unwrap().consumers,
            vec!["align_control"]
        );
        assert!(topology.edge(ChannelRole::DamageProfile).is_none());
        assert_eq!(topology.expected_count(ChannelRole::DamageProfile, 3), 0);
    }

    #[test]
    fn test_every_supported_combination_resolves() {
        for mode in ["ancient", "modern"] {
            for control in [false, true] {
                for aligner in ["kraken2", "centrifuge"] {
                    let config = config(mode, control, aligner);
                    let topology = Topology::build(&StageRegistry::standard(), &config)
                        .unwrap_or_else(|e| panic!("{mode}/{control}/{aligner}: {e}"));

                    for stage in topology.stages() {
                        for role in &stage.inputs {
                            let edge = topology.edge(*role).unwrap();
                            if edge.kind == ChannelKind::Routed {
                                assert_eq!(edge.producers.len(), 1);
                            }
                        }
                    }
                    assert_eq!(topology.stages().iter().filter(|s| s.def.is_aggregator()).count(), 2);
                }
            }
        }
    }

    #[test]
    fn test_enabling_control_only_adds_stages() {
        for mode in ["ancient", "modern"] {
            for aligner in ["kraken2", "centrifuge"] {
                let without = build(&config(mode, false, aligner)).stage_ids();
                let with = build(&config(mode, true, aligner)).stage_ids();
                assert!(without.iter().all(|id| with.contains(id)));
                assert_eq!(with.len(), without.len() + 3);
            }
        }
    }

    #[test]
    fn test_build_is_deterministic() {
        let config = config("ancient", true, "centrifuge");
        let a = build(&config);
        let b = build(&config);
        assert_eq!(a.stage_ids(), b.stage_ids());
        assert_eq!(a.edges(), b.edges());
    }

    #[test]
    fn test_dependency_order() {
        let topology = build(&config("ancient", true, "kraken2"));
        for stage in topology.stages() {
            let pos = topology.position(stage.id()).unwrap();
            for role in &stage.inputs {
                for producer in &topology.edge(*role).unwrap().producers {
                    assert!(topology.position(producer).unwrap() < pos);
                }
            }
        }
    }

    #[test]
    fn test_unresolved_channel() {
        let mut registry = StageRegistry::new();
        registry.register(StageDef::process("orphan", Scope::PerSample).input(ChannelRole::TrimmedReads));

        let err = Topology::build(&registry, &config("ancient", false, "kraken2")).unwrap_err();
        assert!(matches!(err, PipelineError::UnresolvedChannel { role: ChannelRole::TrimmedReads, .. }));
    }

    #[test]
    fn test_ambiguous_routed_producer() {
        let mut registry = StageRegistry::new();
        registry
            .register(StageDef::source("reads", Scope::PerSample, ChannelRole::RawReads))
            .register(StageDef::process("a", Scope::PerSample).input(ChannelRole::RawReads).output(ChannelRole::CleanReads, "{sample}.a"))
            .register(StageDef::process("b", Scope::PerSample).input(ChannelRole::RawReads).output(ChannelRole::CleanReads, "{sample}.b"))
            .register(StageDef::process("c", Scope::PerSample).input(ChannelRole::CleanReads));

        let err = Topology::build(&registry, &config("ancient", false, "kraken2")).unwrap_err();
        match err {
            PipelineError::UnresolvedChannel { stage, reason, .. } => {
                assert_eq!(stage, "c");
                assert!(reason.contains("ambiguous"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_global_stage_cannot_read_per_sample_routed_channel() {
        let mut registry = StageRegistry::new();
        registry
            .register(StageDef::source("reads", Scope::PerSample, ChannelRole::RawReads))
            .register(StageDef::process("g", Scope::Global).input(ChannelRole::RawReads));

        let err = Topology::build(&registry, &config("ancient", false, "kraken2")).unwrap_err();
        assert!(matches!(err, PipelineError::UnresolvedChannel { .. }));
    }

    #[test]
    fn test_cycle_detected() {
        let mut registry = StageRegistry::new();
        registry
            .register(
                StageDef::process("a", Scope::PerSample)
                    .input(ChannelRole::HostUnmapped)
                    .output(ChannelRole::CleanReads, "{sample}.a"),
            )
            .register(
                StageDef::process("b", Scope::PerSample)
                    .input(ChannelRole::CleanReads)
                    .output(ChannelRole::HostUnmapped, "{sample}.b"),
            );

        let err = Topology::build(&registry, &config("ancient", false, "kraken2")).unwrap_err();
        match err {
            PipelineError::TopologyCycle { stages } => assert_eq!(stages, vec!["a", "b"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_duplicate_stage_rejected() {
        let mut registry = StageRegistry::new();
        registry
            .register(StageDef::source("reads", Scope::PerSample, ChannelRole::RawReads))
            .register(StageDef::source("reads", Scope::PerSample, ChannelRole::RawReads).when(always));

        let err = Topology::build(&registry, &config("ancient", false, "kraken2")).unwrap_err();
        assert!(matches!(err, PipelineError::DuplicateStage { .. }));
    }

    #[test]
    fn test_dot_and_display() {
        let topology = build(&config("modern", true, "kraken2"));
        let dot = topology.to_dot();
        assert!(dot.starts_with("digraph pipeline {"));
        assert!(dot.contains("\"align_control\" -> \"multiqc\" [label=\"alignment_metrics\", style=dashed]"));

        let text = topology.to_string();
        assert!(text.contains("index_control"));
        assert!(text.contains("collecting"));
    }
}
