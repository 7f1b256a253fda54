use std::sync::Arc;

use tracing::{error, trace};

use crate::{
    controller::Controller,
    provider::{CompletionContext, CompletionEntry, CompletionFlags, CqEvent},
    stats::Stats,
};

impl Controller {
    /// One poll step over both completion queues. Returns the number of
    /// events handled, at most one per queue.
    pub fn poll_endpoints(self: &Arc<Self>) -> usize {
        self.poll_send_queue() + self.poll_recv_queue()
    }

    /// Reads one entry from the send queue unless another thread is already
    /// reading it.
    pub fn poll_send_queue(self: &Arc<Self>) -> usize {
        let event = {
            let Some(_guard) = self.tx_poll_lock.try_lock() else {
                return 0;
            };
            self.endpoint.read_tx_cq()
        };
        match event {
            Some(event) => {
                self.dispatch_send_event(event);
                1
            }
            None => 0,
        }
    }

    pub fn poll_recv_queue(self: &Arc<Self>) -> usize {
        let event = {
            let Some(_guard) = self.rx_poll_lock.try_lock() else {
                return 0;
            };
            self.endpoint.read_rx_cq()
        };
        match event {
            Some(event) => {
                self.dispatch_recv_event(event);
                1
            }
            None => 0,
        }
    }

    fn dispatch_send_event(self: &Arc<Self>, event: CqEvent) {
        match event {
            CqEvent::Completion(entry) => {
                trace!(context = ?entry.context, flags = ?entry.flags, len = entry.len, "tx completion");
                if entry.flags.contains(CompletionFlags::RMA) {
                    match entry.context {
                        CompletionContext::RmaRead(id) => self.handle_read_completion(id),
                        _ => protocol_violation("send", &entry),
                    }
                } else if entry.flags.contains(CompletionFlags::MSG | CompletionFlags::SEND) {
                    match entry.context {
                        CompletionContext::Sender(handle) => self.handle_send_completion(handle),
                        CompletionContext::Ack(tag) => {
                            trace!(tag, "ack sent");
                            Stats::incr(&self.stats.sent_ack);
                        }
                        _ => protocol_violation("send", &entry),
                    }
                } else {
                    protocol_violation("send", &entry);
                }
            }
            CqEvent::Error { context, flags, error } => match context {
                CompletionContext::Sender(handle) => self.handle_send_error(handle, error),
                CompletionContext::RmaRead(id) => self.handle_read_error(id, error),
                CompletionContext::Ack(tag) => {
                    error!(tag, %error, "ack send failed, peer sender stays parked");
                }
                CompletionContext::Receiver(slot) => {
                    panic!("send queue error for receive slot {} ({:?}): {}", slot, flags, error)
                }
            },
        }
    }

    fn dispatch_recv_event(self: &Arc<Self>, event: CqEvent) {
        match event {
            CqEvent::Completion(entry) => {
                trace!(context = ?entry.context, flags = ?entry.flags, len = entry.len, "rx completion");
                if !entry.flags.contains(CompletionFlags::MSG | CompletionFlags::RECV) {
                    protocol_violation("receive", &entry);
                }
                let CompletionContext::Receiver(slot) = entry.context else {
                    protocol_violation("receive", &entry);
                };
                let Some(src) = entry.src else {
                    panic!("receive completion without a source address: {:?}", entry);
                };
                self.handle_recv_completion(slot, entry.len, src);
            }
            CqEvent::Error { context: CompletionContext::Receiver(slot), error, .. } => {
                self.handle_recv_error(slot, error)
            }
            CqEvent::Error { context, flags, error } => {
                panic!("receive queue error with context {:?} ({:?}): {}", context, flags, error)
            }
        }
    }
}

fn protocol_violation(queue: &str, entry: &CompletionEntry) -> ! {
    panic!("unexpected {} completion: {:?}", queue, entry)
}
