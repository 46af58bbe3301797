use crate::{BindingInfo, Error, PlanHeader, Precision};

/// A deserialized network that execution contexts can be instantiated from
pub trait Network: Send + Sync {
    fn instantiate(&self) -> Result<Box<dyn Kernel>, Error>;
}

/// Per-context state of a network's forward pass
pub trait Kernel: Send {
    /// Run the network
    ///
    /// `inputs` and `outputs` hold the raw device bytes of the input and output bindings, each
    /// in plan binding order.
    fn forward(&mut self, inputs: &[&[u8]], outputs: &mut [&mut [u8]]) -> Result<(), Error>;
}

/// A plan loaded onto a device
pub struct Executable {
    header: PlanHeader,
    network: Box<dyn Network>,
}
impl Executable {
    pub fn new(header: PlanHeader, network: Box<dyn Network>) -> Self {
        Self { header, network }
    }

    pub fn precision(&self) -> Precision {
        self.header.precision
    }

    /// All bindings, inputs and outputs, in plan order
    pub fn bindings(&self) -> &[BindingInfo] {
        &self.header.bindings
    }

    pub fn nb_bindings(&self) -> usize {
        self.header.bindings.len()
    }

    /// Index of the binding with the given name
    pub fn binding_index(&self, name: &str) -> Option<usize> {
        self.header.bindings.iter().position(|b| b.name == name)
    }

    /// Create a context that can run this plan
    ///
    /// # Errors
    ///
    /// Returns [Error::ContextCreation] if the network can't be instantiated.
    pub fn create_execution_context(&self) -> Result<ExecutionContext, Error> {
        let kernel = self
            .network
            .instantiate()
            .map_err(|err| Error::ContextCreation(err.to_string()))?;

        Ok(ExecutionContext {
            bindings: self.header.bindings.clone(),
            kernel,
        })
    }
}

/// Everything needed to run one plan instance
pub struct ExecutionContext {
    bindings: Vec<BindingInfo>,
    kernel: Box<dyn Kernel>,
}
impl ExecutionContext {
    pub fn bindings(&self) -> &[BindingInfo] {
        &self.bindings
    }

    pub fn kernel_mut(&mut self) -> &mut dyn Kernel {
        self.kernel.as_mut()
    }
}
