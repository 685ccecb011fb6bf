//! Execution sessions.
//!
//! A session is a resolved plan over a model: the operators to run, the
//! tensors they read and write, and the input shapes it was last prepared for.
//! Tensors are shared (`Arc<RwLock<..>>`) so that callers can hold on to them
//! between calls; a session never holds a tensor lock while an observer runs.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use crate::config::{PathMode, ScheduleConfig, SubPath};
use crate::error::{Result, RuntimeError};
use crate::model::{Model, OpDesc};
use crate::tensor::{SharedTensor, Tensor};
use crate::types::{DimensionType, ForwardType, TypeTag};

/// Operator details handed to a [`RunObserver`].
#[derive(Debug, Clone, Copy)]
pub struct OpInfo<'a> {
    pub name: &'a str,
    pub kind: &'a str,
    /// Millions of elementwise operations for the current shapes.
    pub flops: f32,
}

/// Hook invoked around every operator of a run, on the calling thread and in
/// operator order.
pub trait RunObserver {
    /// Called with the operator's input tensors. Returning `false` skips the
    /// operator.
    fn before(&mut self, op: &OpInfo<'_>, inputs: &[SharedTensor]) -> bool;

    /// Called with the operator's output tensors. Returning `false` stops the
    /// run with [`RuntimeError::CallbackStop`].
    fn after(&mut self, op: &OpInfo<'_>, outputs: &[SharedTensor]) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created or inputs reshaped; must be resized before running.
    Created,
    /// Resized for the current input shapes.
    Ready,
}

/// Resize status values reported through [`SessionInfo`].
pub const RESIZE_READY: i32 = 0;
pub const RESIZE_NEEDED: i32 = 2;

/// Snapshot reported by [`Session::info`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionInfo {
    pub memory_mb: f32,
    pub flops_m: f32,
    pub backends: i32,
    pub resize_status: i32,
    pub threads: i32,
}

/// Forward type and thread count overrides taken from a runtime manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeOverride {
    pub forward: ForwardType,
    pub num_thread: i32,
}

#[derive(Debug)]
pub struct Session {
    model: Arc<Model>,
    plan: Vec<usize>,
    op_flops: Vec<f32>,
    tensors: HashMap<String, SharedTensor>,
    input_names: Vec<String>,
    output_names: Vec<String>,
    prepared_shapes: Vec<Vec<i32>>,
    state: SessionState,
    forward: ForwardType,
    num_thread: i32,
    memory_mb: f32,
}

impl Session {
    /// Build a session from one or more path configurations. Plans from
    /// several configs are merged, keeping model order and dropping repeats.
    pub fn new(model: Arc<Model>, configs: &[ScheduleConfig<'_>], overrides: Option<RuntimeOverride>) -> Result<Self> {
        let first = configs
            .first()
            .ok_or_else(|| RuntimeError::invalid("no schedule config"))?;

        let mut plan = BTreeSet::new();
        for config in configs {
            plan.extend(resolve_plan(&model, &config.path)?);
            if let Some(backend) = config.backend {
                tracing::debug!(
                    memory = backend.memory,
                    power = backend.power,
                    precision = backend.precision,
                    "backend config"
                );
            }
        }
        let plan: Vec<usize> = plan.into_iter().collect();

        let mut consumed: Vec<&str> = Vec::new();
        let mut produced: Vec<&str> = Vec::new();
        for &i in &plan {
            let op = &model.ops()[i];
            consumed.extend(op.inputs.iter().map(String::as_str));
            produced.extend(op.outputs.iter().map(String::as_str));
        }
        let produced_set: HashSet<&str> = produced.iter().copied().collect();
        let consumed_set: HashSet<&str> = consumed.iter().copied().collect();

        let mut input_names: Vec<String> = Vec::new();
        for name in &consumed {
            if !produced_set.contains(name) && !input_names.iter().any(|n| n == name) {
                input_names.push(name.to_string());
            }
        }

        let mut output_names: Vec<String> = Vec::new();
        let mut push_output = |name: &str| {
            if !output_names.iter().any(|n| n == name) {
                output_names.push(name.to_string());
            }
        };
        for name in &produced {
            if !consumed_set.contains(name) {
                push_output(*name);
            }
        }
        for name in &model.desc().outputs {
            if produced_set.contains(name.as_str()) {
                push_output(name.as_str());
            }
        }
        for config in configs {
            for name in &config.save_tensors {
                if produced_set.contains(name.as_str()) {
                    push_output(name.as_str());
                } else {
                    tracing::debug!(tensor = %name, "retained tensor not produced by this session");
                }
            }
        }

        let static_shapes = static_shapes(&model);
        let mut tensors = HashMap::new();
        for name in &input_names {
            let (shape, dtype) = match model.input(name) {
                Some(desc) => (desc.shape.clone(), model.input_type(desc)?.0),
                None => (static_shapes.get(name).cloned().unwrap_or_default(), TypeTag::F32),
            };
            tensors.insert(name.clone(), Tensor::new(shape, dtype, DimensionType::Caffe)?.into_shared());
        }
        for name in &produced {
            tensors.insert(
                name.to_string(),
                Tensor::new(Vec::new(), TypeTag::F32, DimensionType::Caffe)?.into_shared(),
            );
        }

        let (forward, num_thread) = match overrides {
            Some(o) => (o.forward, o.num_thread),
            None => (first.forward, first.num_thread),
        };
        if forward != ForwardType::Cpu {
            tracing::debug!(?forward, backup = ?first.backup, "reference runtime executes on CPU");
        }

        tracing::debug!(
            ops = plan.len(),
            inputs = input_names.len(),
            outputs = output_names.len(),
            "session created"
        );

        Ok(Self {
            model,
            op_flops: vec![0.0; plan.len()],
            plan,
            tensors,
            input_names,
            output_names,
            prepared_shapes: Vec::new(),
            state: SessionState::Created,
            forward,
            num_thread,
            memory_mb: 0.0,
        })
    }

    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Operators this session runs, in execution order.
    pub fn plan(&self) -> impl Iterator<Item = &OpDesc> {
        self.plan.iter().map(|&i| &self.model.ops()[i])
    }

    pub fn plan_len(&self) -> usize {
        self.plan.len()
    }

    pub fn input_names(&self) -> &[String] {
        &self.input_names
    }

    pub fn output_names(&self) -> &[String] {
        &self.output_names
    }

    /// Input tensor by name; `None` selects the first input.
    pub fn input(&self, name: Option<&str>) -> Result<SharedTensor> {
        self.lookup(&self.input_names, name)
    }

    /// Output tensor by name; `None` selects the first output.
    pub fn output(&self, name: Option<&str>) -> Result<SharedTensor> {
        self.lookup(&self.output_names, name)
    }

    fn lookup(&self, names: &[String], name: Option<&str>) -> Result<SharedTensor> {
        let name = match name {
            Some(n) => names
                .iter()
                .find(|candidate| candidate.as_str() == n)
                .ok_or_else(|| RuntimeError::TensorNotFound(n.to_string()))?,
            None => names
                .first()
                .ok_or_else(|| RuntimeError::TensorNotFound("<first>".to_string()))?,
        };
        self.tensors
            .get(name)
            .cloned()
            .ok_or_else(|| RuntimeError::TensorNotFound(name.clone()))
    }

    pub fn inputs_all(&self) -> Vec<(String, SharedTensor)> {
        self.named(&self.input_names)
    }

    pub fn outputs_all(&self) -> Vec<(String, SharedTensor)> {
        self.named(&self.output_names)
    }

    fn named(&self, names: &[String]) -> Vec<(String, SharedTensor)> {
        names
            .iter()
            .filter_map(|n| self.tensors.get(n).map(|t| (n.clone(), Arc::clone(t))))
            .collect()
    }

    fn current_input_shapes(&self) -> Vec<Vec<i32>> {
        self.input_names
            .iter()
            .map(|n| self.tensors.get(n).map(|t| t.read().shape().to_vec()).unwrap_or_default())
            .collect()
    }

    /// Propagate input shapes through the plan and (re)allocate every
    /// produced tensor.
    pub fn resize(&mut self) -> Result<()> {
        let start = Instant::now();
        let mut total_flops = 0.0f32;
        for (slot, &i) in self.plan.iter().enumerate() {
            let op = &self.model.ops()[i];
            let mut shapes = Vec::with_capacity(op.inputs.len());
            for name in &op.inputs {
                let tensor = self.tensor(name)?;
                let tensor = tensor.read();
                if !tensor.dtype().is_f32() {
                    return Err(RuntimeError::TensorNotSupport(format!(
                        "op '{}' input '{}' is {:?}",
                        op.name,
                        name,
                        tensor.dtype()
                    )));
                }
                shapes.push(tensor.shape().to_vec());
            }
            let operands: Vec<&[i32]> = shapes.iter().map(Vec::as_slice).collect();
            let shape = op.infer_shape(&operands)?;
            let elements: f64 = shape.iter().map(|&d| d as f64).product();
            self.op_flops[slot] = elements as f32 / 1_000_000.0;
            total_flops += self.op_flops[slot];
            for name in &op.outputs {
                self.tensor(name)?.write().reshape(shape.clone())?;
            }
        }

        let bytes: usize = self.tensors.values().map(|t| t.read().size_bytes()).sum();
        self.memory_mb = bytes as f32 / (1024.0 * 1024.0);
        self.prepared_shapes = self.current_input_shapes();
        self.state = SessionState::Ready;
        tracing::debug!(
            flops_m = total_flops,
            memory_mb = self.memory_mb,
            elapsed_us = start.elapsed().as_micros() as u64,
            "session resized"
        );
        Ok(())
    }

    /// Resize; `need_realloc` is accepted for compatibility, every resize
    /// reallocates in the reference runtime.
    pub fn resize_ex(&mut self, need_realloc: bool) -> Result<()> {
        tracing::trace!(need_realloc, "resize_ex");
        self.resize()
    }

    fn tensor(&self, name: &str) -> Result<SharedTensor> {
        self.tensors
            .get(name)
            .cloned()
            .ok_or_else(|| RuntimeError::TensorNotFound(name.to_string()))
    }

    fn ensure_prepared(&self) -> Result<()> {
        if self.state != SessionState::Ready || self.prepared_shapes != self.current_input_shapes() {
            return Err(RuntimeError::ResizeRequired);
        }
        Ok(())
    }

    /// Whether the current input shapes match the last resize.
    pub fn is_prepared(&self) -> bool {
        self.ensure_prepared().is_ok()
    }

    pub fn run(&mut self) -> Result<()> {
        self.run_observed(None)
    }

    /// Run the plan, notifying `observer` around each operator.
    pub fn run_observed(&mut self, mut observer: Option<&mut dyn RunObserver>) -> Result<()> {
        if let Err(e) = self.ensure_prepared() {
            self.state = SessionState::Created;
            return Err(e);
        }
        let start = Instant::now();
        let mut executed = 0usize;
        for (slot, &i) in self.plan.iter().enumerate() {
            let op = &self.model.ops()[i];
            let info = OpInfo {
                name: &op.name,
                kind: op.kind.name(),
                flops: self.op_flops[slot],
            };
            let inputs = op
                .inputs
                .iter()
                .map(|n| self.tensor(n))
                .collect::<Result<Vec<_>>>()?;
            let outputs = op
                .outputs
                .iter()
                .map(|n| self.tensor(n))
                .collect::<Result<Vec<_>>>()?;

            if let Some(obs) = observer.as_deref_mut() {
                if !obs.before(&info, &inputs) {
                    tracing::trace!(op = %op.name, "op skipped by observer");
                    continue;
                }
            }

            execute(op, &inputs, &outputs)?;
            executed += 1;

            if let Some(obs) = observer.as_deref_mut() {
                if !obs.after(&info, &outputs) {
                    return Err(RuntimeError::CallbackStop(op.name.clone()));
                }
            }
        }
        tracing::debug!(
            executed,
            elapsed_us = start.elapsed().as_micros() as u64,
            "session run complete"
        );
        Ok(())
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            memory_mb: self.memory_mb,
            flops_m: self.op_flops.iter().sum(),
            backends: self.forward as i32,
            resize_status: if self.is_prepared() { RESIZE_READY } else { RESIZE_NEEDED },
            threads: self.num_thread,
        }
    }

    pub fn forward(&self) -> ForwardType {
        self.forward
    }

    pub fn num_thread(&self) -> i32 {
        self.num_thread
    }
}

fn execute(op: &OpDesc, inputs: &[SharedTensor], outputs: &[SharedTensor]) -> Result<()> {
    let guards: Vec<_> = inputs.iter().map(|t| t.read()).collect();
    let operands = guards
        .iter()
        .map(|g| g.as_f32())
        .collect::<Result<Vec<&[f32]>>>()?;
    for output in outputs {
        let mut out = output.write();
        op.apply(&operands, out.as_f32_mut()?);
    }
    Ok(())
}

fn resolve_plan(model: &Model, path: &SubPath) -> Result<Vec<usize>> {
    let ops = model.ops();
    if path.is_unconstrained() {
        return Ok((0..ops.len()).collect());
    }
    let plan = match path.mode {
        PathMode::Op => {
            let find = |name: &String| {
                model
                    .op_index(name)
                    .ok_or_else(|| RuntimeError::NoExecution(format!("unknown op '{}'", name)))
            };
            let starts = path.inputs.iter().map(find).collect::<Result<Vec<_>>>()?;
            let ends = path.outputs.iter().map(find).collect::<Result<Vec<_>>>()?;
            let start = starts.into_iter().min().unwrap_or(0);
            let end = ends.into_iter().min().unwrap_or(ops.len());
            (start..end).collect::<Vec<_>>()
        }
        PathMode::Tensor => {
            let provided: HashSet<&str> = path.inputs.iter().map(String::as_str).collect();
            let mut visited = BTreeSet::new();
            let mut stack: Vec<&str> = Vec::new();
            for output in &path.outputs {
                if model.producer(output).is_none() && model.input(output).is_none() {
                    return Err(RuntimeError::NoExecution(format!("output '{}' is unreachable", output)));
                }
                stack.push(output);
            }
            while let Some(tensor) = stack.pop() {
                if provided.contains(tensor) {
                    continue;
                }
                if let Some(i) = model.producer(tensor) {
                    if visited.insert(i) {
                        stack.extend(ops[i].inputs.iter().map(String::as_str));
                    }
                }
            }
            visited.into_iter().collect()
        }
    };
    if plan.is_empty() {
        return Err(RuntimeError::NoExecution("sub-path selects no operators".to_string()));
    }
    Ok(plan)
}

/// Shapes of every tensor computed from the declared input shapes, skipping
/// anything that fails to infer.
fn static_shapes(model: &Model) -> HashMap<String, Vec<i32>> {
    let mut shapes: HashMap<String, Vec<i32>> = model
        .desc()
        .inputs
        .iter()
        .map(|i| (i.name.clone(), i.shape.clone()))
        .collect();
    for op in model.ops() {
        let operands: Option<Vec<&[i32]>> = op.inputs.iter().map(|n| shapes.get(n).map(Vec::as_slice)).collect();
        let Some(operands) = operands else { continue };
        if let Ok(shape) = op.infer_shape(&operands) {
            for output in &op.outputs {
                shapes.insert(output.clone(), shape.clone());
            }
        }
    }
    shapes
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const DIAMOND: &str = r#"{
        "inputs": [{"name": "x", "shape": [1, 4]}],
        "ops": [
            {"name": "neg", "type": "Neg", "inputs": ["x"], "outputs": ["a"]},
            {"name": "relu", "type": "ReLU", "inputs": ["x"], "outputs": ["b"]},
            {"name": "add", "type": "Add", "inputs": ["a", "b"], "outputs": ["c"]},
            {"name": "scale", "type": "Scale", "inputs": ["c"], "outputs": ["output"], "scale": 2.0, "bias": 1.0}
        ],
        "outputs": ["output"]
    }"#;

    fn model() -> Arc<Model> {
        Arc::new(Model::from_bytes(DIAMOND.as_bytes()).unwrap())
    }

    fn path(mode: PathMode, inputs: &[&str], outputs: &[&str]) -> ScheduleConfig<'static> {
        ScheduleConfig {
            path: SubPath {
                inputs: inputs.iter().map(|s| s.to_string()).collect(),
                outputs: outputs.iter().map(|s| s.to_string()).collect(),
                mode,
            },
            ..Default::default()
        }
    }

    #[derive(Default)]
    struct Recorder {
        before: Vec<(String, usize)>,
        after: Vec<(String, usize)>,
        skip: Option<&'static str>,
        stop_after: Option<&'static str>,
    }

    impl RunObserver for Recorder {
        fn before(&mut self, op: &OpInfo<'_>, inputs: &[SharedTensor]) -> bool {
            self.before.push((op.name.to_string(), inputs.len()));
            self.skip != Some(op.name)
        }

        fn after(&mut self, op: &OpInfo<'_>, outputs: &[SharedTensor]) -> bool {
            self.after.push((op.name.to_string(), outputs.len()));
            self.stop_after != Some(op.name)
        }
    }

    #[test]
    fn test_full_graph_run() {
        let mut session = Session::new(model(), &[ScheduleConfig::default()], None).unwrap();
        assert_eq!(session.input_names(), &["x".to_string()]);
        assert_eq!(session.output_names(), &["output".to_string()]);

        session
            .input(None)
            .unwrap()
            .write()
            .as_f32_mut()
            .unwrap()
            .copy_from_slice(&[1.0, -2.0, 3.0, -4.0]);
        session.resize().unwrap();
        session.run().unwrap();

        // neg(x) + relu(x) is -min(x, 0); then * 2 + 1
        let out = session.output(Some("output")).unwrap();
        assert_eq!(out.read().as_f32().unwrap(), &[1.0, 5.0, 1.0, 9.0]);
    }

    #[test]
    fn test_run_requires_resize() {
        let mut session = Session::new(model(), &[ScheduleConfig::default()], None).unwrap();
        assert!(matches!(session.run(), Err(RuntimeError::ResizeRequired)));

        session.resize().unwrap();
        session.run().unwrap();

        session.input(None).unwrap().write().reshape(vec![2, 4]).unwrap();
        assert!(matches!(session.run(), Err(RuntimeError::ResizeRequired)));
        assert_eq!(session.info().resize_status, RESIZE_NEEDED);

        session.resize().unwrap();
        session.run().unwrap();
        assert_eq!(session.output(None).unwrap().read().shape(), &[2, 4]);
    }

    #[test]
    fn test_lookups_return_same_tensor() {
        let session = Session::new(model(), &[ScheduleConfig::default()], None).unwrap();
        let a = session.output(Some("output")).unwrap();
        let b = session.output(Some("output")).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(session.output(Some("nope")).is_err());
    }

    #[test]
    fn test_observer_counts() {
        let mut session = Session::new(model(), &[ScheduleConfig::default()], None).unwrap();
        session.resize().unwrap();
        let mut rec = Recorder::default();
        session.run_observed(Some(&mut rec)).unwrap();
        assert_eq!(
            rec.before,
            vec![
                ("neg".to_string(), 1),
                ("relu".to_string(), 1),
                ("add".to_string(), 2),
                ("scale".to_string(), 1)
            ]
        );
        assert_eq!(rec.after.len(), 4);
        assert!(rec.after.iter().all(|(_, n)| *n == 1));
    }

    #[test]
    fn test_observer_skip_and_stop() {
        let mut session = Session::new(model(), &[ScheduleConfig::default()], None).unwrap();
        session.resize().unwrap();

        let mut rec = Recorder {
            skip: Some("relu"),
            ..Default::default()
        };
        session.run_observed(Some(&mut rec)).unwrap();
        assert_eq!(rec.before.len(), 4);
        assert_eq!(rec.after.len(), 3);

        let mut rec = Recorder {
            stop_after: Some("add"),
            ..Default::default()
        };
        let err = session.run_observed(Some(&mut rec)).unwrap_err();
        assert!(matches!(err, RuntimeError::CallbackStop(op) if op == "add"));
        assert_eq!(rec.before.len(), 3);
    }

    #[test]
    fn test_op_mode_path() {
        let config = path(PathMode::Op, &["relu"], &["scale"]);
        let session = Session::new(model(), &[config], None).unwrap();
        let names: Vec<_> = session.plan().map(|op| op.name.clone()).collect();
        assert_eq!(names, vec!["relu", "add"]);
        assert_eq!(session.input_names(), &["x".to_string(), "a".to_string()]);
        assert_eq!(session.output_names(), &["c".to_string()]);
    }

    #[test]
    fn test_tensor_mode_path() {
        let config = path(PathMode::Tensor, &["c"], &["output"]);
        let session = Session::new(model(), &[config], None).unwrap();
        assert_eq!(session.plan_len(), 1);
        assert_eq!(session.input_names(), &["c".to_string()]);
        assert_eq!(session.input(None).unwrap().read().shape(), &[1, 4]);

        let unreachable = path(PathMode::Tensor, &["x"], &["missing"]);
        assert!(matches!(
            Session::new(model(), &[unreachable], None),
            Err(RuntimeError::NoExecution(_))
        ));
    }

    #[test]
    fn test_multi_path_merges_plans() {
        let a = path(PathMode::Op, &["neg"], &["add"]);
        let b = path(PathMode::Op, &["relu"], &["scale"]);
        let session = Session::new(model(), &[a, b], None).unwrap();
        let names: Vec<_> = session.plan().map(|op| op.name.clone()).collect();
        assert_eq!(names, vec!["neg", "relu", "add"]);
    }

    #[test]
    fn test_save_tensors_become_outputs() {
        let mut config = ScheduleConfig::default();
        config.save_tensors = vec!["a".to_string(), "x".to_string()];
        let session = Session::new(model(), &[config], None).unwrap();
        assert_eq!(session.output_names(), &["output".to_string(), "a".to_string()]);
    }

    #[test]
    fn test_runtime_override() {
        let overrides = RuntimeOverride {
            forward: ForwardType::Vulkan,
            num_thread: 2,
        };
        let session = Session::new(model(), &[ScheduleConfig::default()], Some(overrides)).unwrap();
        let info = session.info();
        assert_eq!(info.threads, 2);
        assert_eq!(info.backends, ForwardType::Vulkan as i32);
    }
}
