use crate::{DevicePtr, Error, ExecutionContext, Runtime};

enum Op<'a> {
    CopyHtoD {
        dst: DevicePtr,
        src: &'a [u8],
    },
    Launch {
        context: &'a mut ExecutionContext,
        bindings: Vec<DevicePtr>,
    },
    CopyDtoH {
        dst: &'a mut [u8],
        src: DevicePtr,
    },
}

/// An ordered queue of device work
///
/// Operations are recorded by the `*_async` methods and [Stream::enqueue], and run in
/// submission order by [Stream::synchronize]. Host buffers stay borrowed until then.
pub struct Stream<'a> {
    runtime: &'a dyn Runtime,
    ops: Vec<Op<'a>>,
}
impl<'a> Stream<'a> {
    pub fn new(runtime: &'a dyn Runtime) -> Self {
        Self {
            runtime,
            ops: Vec::new(),
        }
    }

    pub fn copy_htod_async(&mut self, dst: DevicePtr, src: &'a [u8]) {
        self.ops.push(Op::CopyHtoD { dst, src });
    }

    /// Queue a launch of `context` over `bindings`
    pub fn enqueue(&mut self, context: &'a mut ExecutionContext, bindings: &[DevicePtr]) {
        self.ops.push(Op::Launch {
            context,
            bindings: bindings.to_vec(),
        });
    }

    pub fn copy_dtoh_async(&mut self, dst: &'a mut [u8], src: DevicePtr) {
        self.ops.push(Op::CopyDtoH { dst, src });
    }

    /// Number of queued operations
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Run every queued operation in order and wait for them
    ///
    /// # Errors
    ///
    /// Stops at the first failing operation; later operations are dropped.
    pub fn synchronize(self) -> Result<(), Error> {
        let runtime = self.runtime;
        for op in self.ops {
            match op {
                Op::CopyHtoD { dst, src } => runtime.memcpy_htod(dst, src)?,
                Op::Launch { context, bindings } => runtime.launch(context, &bindings)?,
                Op::CopyDtoH { dst, src } => runtime.memcpy_dtoh(dst, src)?,
            }
        }

        Ok(())
    }
}
