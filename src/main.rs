use std::sync::Arc;

use beamvm::bytecode::assemble;
use beamvm::linker::Linker;
use beamvm::term::Term;
use beamvm::vm::{call_export, LocalRuntime, Outcome, Process};

const LISTING: &str = "
{module, demo}.
{exports, [{sum,1}]}.

{function, sum, 1, 2}.
  {label,1}.
    {func_info,{atom,demo},{atom,sum},1}.
  {label,2}.
    {move,{integer,0},{x,1}}.
    {call_only,2,{f,4}}.

{function, sum, 2, 4}.
  {label,3}.
    {func_info,{atom,demo},{atom,sum},2}.
  {label,4}.
    {is_nonempty_list,{f,5},{x,0}}.
    {get_list,{x,0},{x,2},{x,0}}.
    {gc_bif2,{f,0},3,{extfunc,erlang,'+',2},{x,1},{x,2},{x,1}}.
    {call_only,2,{f,4}}.
  {label,5}.
    {is_nil,{f,3},{x,0}}.
    {move,{x,1},{x,0}}.
    return.
";

fn main() {
  #[cfg(feature = "trace_computation")]
  println!("Computation Tracing ENABLED");

  let module = match assemble(LISTING) {
    Ok(module) => module,
    Err(error) => {
      eprintln!("{}", error);
      return;
    }
  };
  println!("Module {}:\n{}", module.name(), module.disassemble());

  let mut linker = Linker::with_erlang_natives();
  linker.load(module);
  for id in linker.link_all() {
    println!("Unresolved import: {}", id);
  }

  let mut runtime = LocalRuntime::new(Arc::new(linker));
  let mut process = Process::new();
  let numbers = Term::list((1..=10).map(Term::Integer).collect());

  match call_export(&mut process, &mut runtime, "demo", "sum", vec![numbers.clone()]) {
    Ok(Outcome::Return(value))  => println!("demo:sum({}) = {}", numbers, value),
    Ok(Outcome::Suspend(c))     => println!("demo:sum({}) suspended: {:?}", numbers, c),
    Err(error)                  => println!("demo:sum({}) failed: {}", numbers, error),
  }
  println!("{}", process);
}
