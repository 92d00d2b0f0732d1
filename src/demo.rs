//! The bundled demo program, written against the probe runtime.
//!
//! `shop.rb` fills a cart with three items and prints the total. A
//! `ticker` thread runs alongside so thread commands have something to
//! show.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use snag_core::probe::ProbeThread;
use snag_core::source::CodeUnit;
use snag_core::{EvalError, Value};

const SHOP_SRC: &str = "\
require_relative 'cart'
cart = Cart.new
cart.add('apple', 3)
cart.add('pear', 2)
cart.add('plum', 5)
total = cart.total
puts \"total: #{total}\"
";

const CART_SRC: &str = "\
class Cart
  def add(name, qty)
    @count = (@count || 0) + qty
    @last = name
    @count
  end

  def total
    @count * 2
  end
end
";

const TICKER_SRC: &str = "\
loop do
  $ticks = $ticks + 1
  sleep 0.05
end
";

fn shop_unit() -> Arc<CodeUnit> {
    CodeUnit::script("shop.rb", 1, 7)
        .lines([1, 2, 3, 4, 5, 6, 7])
        .build()
}

fn cart_unit() -> Arc<CodeUnit> {
    CodeUnit::script("cart.rb", 1, 11)
        .lines([1, 2, 8])
        .child(CodeUnit::method("Cart#add", 2, 6).lines([3, 4, 5]))
        .child(CodeUnit::method("Cart#total", 8, 10).lines([9]))
        .build()
}

fn spawn_error(e: std::io::Error) -> EvalError {
    EvalError::Raised {
        class: "ThreadError".into(),
        message: e.to_string(),
    }
}

fn load_cart(t: &ProbeThread) {
    let cart = cart_unit();
    t.load(&cart, CART_SRC);
    let add = Arc::clone(&cart.children()[0]);
    let total = Arc::clone(&cart.children()[1]);
    t.define_method(
        "Cart",
        "add",
        &["name", "qty"],
        &add,
        Arc::new(|t: &ProbeThread| {
            t.line(3);
            t.eval("@count = (@count || 0) + qty")?;
            t.line(4);
            t.eval("@last = name")?;
            t.line(5);
            t.eval("@count")
        }),
    );
    t.define_method(
        "Cart",
        "total",
        &[],
        &total,
        Arc::new(|t: &ProbeThread| {
            t.line(9);
            t.eval("@count * 2")
        }),
    );
}

fn ticker(t: &ProbeThread, done: &AtomicBool) -> Result<Value, EvalError> {
    let unit = CodeUnit::script("ticker.rb", 1, 4).lines([2, 3]).build();
    t.load(&unit, TICKER_SRC);
    t.run_script(&unit, |t| {
        while !done.load(Ordering::SeqCst) {
            t.line(2);
            t.eval("$ticks = $ticks + 1")?;
            t.line(3);
            std::thread::sleep(Duration::from_millis(50));
        }
        Ok(Value::Nil)
    })
}

/// The whole demo, run as the `main` program thread.
pub fn program(t: &ProbeThread) -> Result<Value, EvalError> {
    t.runtime().set_global("$ticks", Value::Int(0));
    let done = Arc::new(AtomicBool::new(false));
    let shop = shop_unit();
    t.load(&shop, SHOP_SRC);
    let result = t.run_script(&shop, |t| {
        t.line(1);
        let flag = Arc::clone(&done);
        let worker = t
            .runtime()
            .spawn("ticker", move |t| ticker(t, &flag))
            .map_err(spawn_error)?;
        load_cart(t);
        t.line(2);
        let cart = t.call(&Value::Class("Cart".into()), "new", vec![])?;
        t.set("cart", cart.clone());
        for (line, (name, qty)) in [(3, ("apple", 3)), (4, ("pear", 2)), (5, ("plum", 5))] {
            t.line(line);
            t.call(&cart, "add", vec![Value::Str(name.into()), Value::Int(qty)])?;
        }
        t.line(6);
        let total = t.call(&cart, "total", vec![])?;
        t.set("total", total.clone());
        t.line(7);
        println!("total: {total}");
        done.store(true, Ordering::SeqCst);
        if worker.join().is_err() {
            tracing::warn!("ticker thread panicked");
        }
        Ok(total)
    });
    done.store(true, Ordering::SeqCst);
    result
}
