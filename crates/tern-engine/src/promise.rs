//! Promise settlement and reaction jobs

use crate::error::{EngineResult, ErrorKind, Throw};
use crate::heap::{Callable, ObjectKind, PromiseSlot, PromiseState, Reaction};
use crate::isolate::Microtask;
use crate::value::{ObjectId, RawValue, ValueKind};
use crate::vm::Vm;

pub(crate) fn new_promise(vm: &Vm<'_>, realm: u32) -> EngineResult<ObjectId> {
    let proto = vm.promise_proto(realm)?;
    let slot = PromiseSlot {
        state: PromiseState::Pending,
        result: RawValue::Undefined,
        reactions: Vec::new(),
    };
    vm.alloc(ObjectKind::Promise(slot), Some(proto))
}

/// The `resolve` and `reject` functions handed to an executor
pub(crate) fn resolving_functions(vm: &Vm<'_>, realm: u32, promise: ObjectId) -> EngineResult<(RawValue, RawValue)> {
    let make = |reject| {
        vm.alloc(
            ObjectKind::Function(Callable::Resolving {
                promise,
                reject,
                realm,
            }),
            None,
        )
        .map(RawValue::Object)
    };
    Ok((make(false)?, make(true)?))
}

/// Resolve `promise` with `value`, adopting the state of thenables that are
/// engine promises. Settled promises are left alone.
pub(crate) fn resolve(vm: &Vm<'_>, promise: ObjectId, value: RawValue) -> EngineResult<()> {
    if vm.promise_state(promise) != Some(PromiseState::Pending) {
        return Ok(());
    }
    if value.as_object() == Some(promise) {
        let error = vm.make_error(
            ErrorKind::TypeError,
            "Chaining cycle detected for promise #<Promise>",
        )?;
        reject(vm, promise, error);
        return Ok(());
    }
    if let Some(inner) = value.as_object().filter(|id| vm.promise_state(*id).is_some()) {
        subscribe(
            vm,
            inner,
            Reaction {
                derived: Some(promise),
                on_fulfilled: None,
                on_rejected: None,
            },
        );
        return Ok(());
    }
    settle(vm, promise, value, false);
    Ok(())
}

pub(crate) fn reject(vm: &Vm<'_>, promise: ObjectId, reason: RawValue) {
    settle(vm, promise, reason, true);
}

/// Register handlers on `promise`; returns the derived promise
pub(crate) fn then(
    vm: &Vm<'_>,
    realm: u32,
    promise: ObjectId,
    on_fulfilled: Option<RawValue>,
    on_rejected: Option<RawValue>,
) -> EngineResult<ObjectId> {
    let derived = new_promise(vm, realm)?;
    let callable = |handler: Option<RawValue>| handler.filter(|h| vm.kind_of(h) == ValueKind::Function);
    subscribe(
        vm,
        promise,
        Reaction {
            derived: Some(derived),
            on_fulfilled: callable(on_fulfilled),
            on_rejected: callable(on_rejected),
        },
    );
    Ok(derived)
}

fn job(reaction: Reaction, argument: RawValue, rejected: bool) -> Microtask {
    Microtask {
        handler: if rejected {
            reaction.on_rejected
        } else {
            reaction.on_fulfilled
        },
        derived: reaction.derived,
        argument,
        rejected,
    }
}

fn settle(vm: &Vm<'_>, promise: ObjectId, value: RawValue, rejected: bool) {
    let reactions = {
        let mut heap = vm.core().heap.lock();
        let Some(ObjectKind::Promise(slot)) = heap.get_mut(promise).map(|o| &mut o.kind) else {
            return;
        };
        if slot.state != PromiseState::Pending {
            return;
        }
        slot.state = if rejected {
            PromiseState::Rejected
        } else {
            PromiseState::Fulfilled
        };
        slot.result = value.clone();
        std::mem::take(&mut slot.reactions)
    };
    let mut queue = vm.core().microtasks.lock();
    for reaction in reactions {
        queue.push_back(job(reaction, value.clone(), rejected));
    }
}

fn subscribe(vm: &Vm<'_>, promise: ObjectId, reaction: Reaction) {
    let mut heap = vm.core().heap.lock();
    let Some(ObjectKind::Promise(slot)) = heap.get_mut(promise).map(|o| &mut o.kind) else {
        return;
    };
    if slot.state == PromiseState::Pending {
        slot.reactions.push(reaction);
        return;
    }
    let rejected = slot.state == PromiseState::Rejected;
    let argument = slot.result.clone();
    drop(heap);
    vm.core()
        .microtasks
        .lock()
        .push_back(job(reaction, argument, rejected));
}

/// Run one reaction and settle its derived promise with the outcome
pub(crate) fn run_job(vm: &Vm<'_>, job: Microtask) -> EngineResult<()> {
    let outcome = match &job.handler {
        Some(handler) => vm
            .call(handler, RawValue::Undefined, &[job.argument.clone()])
            .map(|value| (value, false)),
        None => Ok((job.argument, job.rejected)),
    };
    let Some(derived) = job.derived else {
        return match outcome {
            Err(Throw::Terminated) => Err(Throw::Terminated),
            _ => Ok(()),
        };
    };
    match outcome {
        Ok((value, false)) => resolve(vm, derived, value),
        Ok((reason, true)) => {
            reject(vm, derived, reason);
            Ok(())
        }
        Err(Throw::Exception(details)) => {
            reject(vm, derived, details.exception);
            Ok(())
        }
        Err(other) => Err(other),
    }
}
